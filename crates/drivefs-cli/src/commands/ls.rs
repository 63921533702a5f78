use drivefs_fuse::dir_handle::fetch_listing;
use drivefs_fuse::PathResolver;

use super::{format_size, Session};

pub async fn run(session: &Session, path: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let path = path.as_deref().unwrap_or("/");
    let resolver = PathResolver::new(session.client.as_ref(), &session.cache);
    let target = resolver.resolve(path).await?;

    let entries = if target.is_folder() {
        fetch_listing(session.client.as_ref(), &session.cache, &target.file_id)
            .await?
            .to_vec()
    } else {
        vec![target]
    };

    if entries.is_empty() {
        println!("(empty)");
        return Ok(());
    }

    for entry in entries {
        let type_indicator = if entry.is_folder() { "d" } else { "-" };
        let size = if entry.is_folder() {
            "-".to_string()
        } else {
            format_size(entry.size)
        };
        println!("{} {:>8}  {}", type_indicator, size, entry.name);
    }

    Ok(())
}
