use std::path::PathBuf;

use aurum_node::run_node;

#[tokio::main]
async fn main() {
    let path = std::env::var("AURUM_CONFIG").unwrap_or_else(|_| "config/aurum.toml".to_string());
    if let Err(e) = run_node(PathBuf::from(path)).await {
        eprintln!("node failed: {e:?}");
    }
}
