use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration for a drivefs mount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Optional display name, used in logs.
    pub name: Option<String>,
    pub auth: AuthConfig,
    pub api: ApiConfig,
    pub mount: MountConfig,
    pub listing: ListingConfig,
    pub upload: UploadConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
}

/// Credential sources and the refresh loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Refresh token given inline. Takes precedence over `token_file`.
    pub refresh_token: Option<String>,
    /// File holding the refresh token; rewritten when the token rotates.
    pub token_file: String,
    /// How often the access token is refreshed.
    pub refresh_interval: HumanDuration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            refresh_token: None,
            token_file: ".refresh_token".to_string(),
            refresh_interval: HumanDuration(Duration::from_secs(120)),
        }
    }
}

/// Remote API endpoints and request headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL for drive API calls.
    pub base_url: String,
    /// URL of the token refresh endpoint.
    pub auth_url: String,
    /// User agent sent with every API request.
    pub user_agent: String,
    /// Origin/referer of the web client.
    pub referer: String,
    /// Per-request timeout.
    pub timeout: HumanDuration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: "https://api.aliyundrive.com".to_string(),
            auth_url: "https://websv.aliyundrive.com/token/refresh".to_string(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/92.0.4515.159 Safari/537.36"
                .to_string(),
            referer: "https://www.aliyundrive.com".to_string(),
            timeout: HumanDuration(Duration::from_secs(60)),
        }
    }
}

/// Kernel-facing mount options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Where to mount. The CLI argument overrides this.
    pub mountpoint: Option<String>,
    /// Filesystem name reported to the kernel.
    pub fs_name: String,
    pub allow_other: bool,
    pub auto_unmount: bool,
    /// Permission bits for directories.
    pub dir_mode: u16,
    /// Permission bits for regular files.
    pub file_mode: u16,
    /// How long the kernel may cache attributes and entries.
    pub attr_ttl: HumanDuration,
    /// Directory for write staging files. Defaults to the system temp dir.
    pub staging_dir: Option<String>,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mountpoint: None,
            fs_name: "drivefs".to_string(),
            allow_other: false,
            auto_unmount: true,
            dir_mode: 0o755,
            file_mode: 0o644,
            attr_ttl: HumanDuration(Duration::from_secs(1)),
            staging_dir: None,
        }
    }
}

/// Directory listing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// Entries requested per listing page.
    pub page_size: u32,
    /// Lifetime requested for URLs embedded in listings.
    pub url_expire_sec: u64,
}

impl Default for ListingConfig {
    fn default() -> Self {
        ListingConfig {
            page_size: 200,
            url_expire_sec: 1600,
        }
    }
}

/// Upload pipeline parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Size of each uploaded part.
    pub part_size: ByteSize,
    /// Files must be strictly larger than this to try rapid upload.
    pub rapid_min_size: ByteSize,
    /// Files larger than this never try rapid upload.
    pub rapid_max_size: ByteSize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            part_size: ByteSize(10 * 1024 * 1024),
            rapid_min_size: ByteSize(15 * 1024),
            rapid_max_size: ByteSize(25 * 1024 * 1024 * 1024),
        }
    }
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Linearly increasing delay
    Linear,
    /// Exponentially increasing delay
    Exponential,
}

/// Bounded retry settings for each class of remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts for API POSTs and ranged GETs.
    pub read_attempts: u32,
    pub read_delay: HumanDuration,
    /// Attempts for a single part PUT.
    pub part_attempts: u32,
    pub part_delay: HumanDuration,
    /// Attempts to renew expired part upload URLs.
    pub renew_attempts: u32,
    pub renew_delay: HumanDuration,
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            read_attempts: 5,
            read_delay: HumanDuration(Duration::from_secs(5)),
            part_attempts: 15,
            part_delay: HumanDuration(Duration::from_secs(5)),
            renew_attempts: 10,
            renew_delay: HumanDuration(Duration::from_secs(10)),
            backoff: BackoffStrategy::Fixed,
        }
    }
}

/// Metadata cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Staleness ceiling. Entries live until invalidated when unset.
    pub ttl: Option<HumanDuration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            ttl: None,
        }
    }
}

/// Human-readable duration (e.g., "5m", "1h", "30s").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl Default for HumanDuration {
    fn default() -> Self {
        HumanDuration(Duration::from_secs(0))
    }
}

impl HumanDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();

        let (num_str, unit) = if let Some(n) = s.strip_suffix("ms") {
            (n, "ms")
        } else if let Some(n) = s.strip_suffix('s') {
            (n, "s")
        } else if let Some(n) = s.strip_suffix('m') {
            (n, "m")
        } else if let Some(n) = s.strip_suffix('h') {
            (n, "h")
        } else {
            return Err(format!("Invalid duration format: {}", s));
        };

        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", s))?;

        let duration = match unit {
            "ms" => Duration::from_millis(num),
            "s" => Duration::from_secs(num),
            "m" => Duration::from_secs(num * 60),
            _ => Duration::from_secs(num * 3600),
        };

        Ok(HumanDuration(duration))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        let secs = self.0.as_secs();

        if millis % 1000 != 0 {
            write!(f, "{}ms", millis)
        } else if secs % 3600 == 0 && secs > 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 && secs > 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        HumanDuration::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Byte count accepting either a plain integer or a suffixed string
/// ("512KiB", "10MiB", "25GiB").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (num_str, unit) = s.split_at(split);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in size: {}", s))?;

        let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => 1024,
            "m" | "mb" | "mib" => 1024 * 1024,
            "g" | "gb" | "gib" => 1024 * 1024 * 1024,
            other => return Err(format!("Unknown size unit: {}", other)),
        };

        num.checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| format!("Size overflows: {}", s))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GIB: u64 = 1024 * 1024 * 1024;
        const MIB: u64 = 1024 * 1024;
        const KIB: u64 = 1024;

        match self.0 {
            0 => write!(f, "0"),
            n if n % GIB == 0 => write!(f, "{}GiB", n / GIB),
            n if n % MIB == 0 => write!(f, "{}MiB", n / MIB),
            n if n % KIB == 0 => write!(f, "{}KiB", n / KIB),
            n => write!(f, "{}", n),
        }
    }
}

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(ByteSize(n)),
            Raw::Str(s) => ByteSize::from_str(&s).map_err(serde::de::Error::custom),
        }
    }
}
