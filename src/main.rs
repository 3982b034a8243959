use std::path::PathBuf;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Usage: camkeeper [--config <path>]");
        println!();
        println!("Config path defaults to ${} or the platform config directory.", camkeeper_lib::config::CONFIG_ENV);
        return;
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    if let Err(e) = camkeeper_lib::run(config_path).await {
        eprintln!("[Camkeeper] Fatal: {:#}", e);
        std::process::exit(1);
    }
}
