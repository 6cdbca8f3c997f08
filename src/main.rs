use std::path::PathBuf;

const DEFAULT_CONFIG: &str = "~/.relay-proxy/config.yaml";

fn config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            if let Some(path) = args.next() {
                return relay_proxy::config::resolve_path(&path);
            }
        } else if let Some(path) = arg.strip_prefix("--config=") {
            return relay_proxy::config::resolve_path(path);
        }
    }
    relay_proxy::config::resolve_path(DEFAULT_CONFIG)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_proxy::run(&config_path()).await
}
