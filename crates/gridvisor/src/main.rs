// gridvisor CLI entry point

#[tokio::main]
async fn main() {
    match gridvisor::cli::route().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
