use drivefs_fuse::PathResolver;

use super::Session;

pub async fn run(session: &Session, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = PathResolver::new(session.client.as_ref(), &session.cache);
    let entry = resolver.resolve(path).await?;

    println!("Path:     {}", path);
    println!("Name:     {}", entry.name);
    println!("Id:       {}", entry.file_id);
    println!("Type:     {}", if entry.is_folder() { "directory" } else { "file" });
    if !entry.is_folder() {
        println!("Size:     {} bytes", entry.size);
    }
    if let Some(hash) = &entry.content_hash {
        println!("SHA1:     {}", hash);
    }
    if let Some(modified) = entry.updated_at {
        println!("Modified: {}", modified.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if entry.file_id != "root" {
        let parent = resolver.absolute_path(&entry.file_id, entry.kind).await?;
        println!("Parent:   {}", parent);
    }

    Ok(())
}
