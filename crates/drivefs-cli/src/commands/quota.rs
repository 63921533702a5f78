use drivefs_core::CloudClient;

use super::{format_size, Session};

pub async fn run(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    let quota = session.client.quota().await?;
    println!("Total:  {:>8}", format_size(quota.total));
    println!("Used:   {:>8}", format_size(quota.used));
    println!("Free:   {:>8}", format_size(quota.free()));
    Ok(())
}
