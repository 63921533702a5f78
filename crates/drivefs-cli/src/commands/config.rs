use drivefs_config::DriveConfig;

pub fn run(config: &DriveConfig) -> Result<(), Box<dyn std::error::Error>> {
    let yaml = serde_yaml::to_string(config)?;
    println!("{}", yaml);
    Ok(())
}
