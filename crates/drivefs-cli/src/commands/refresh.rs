use super::Session;

pub fn run(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    let credentials = session.cell.load();
    println!("Drive:    {}", credentials.drive_id);
    if let Some(expires_at) = credentials.expires_at {
        println!("Expires:  {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("Token:    {}", session.store.path().display());
    Ok(())
}
