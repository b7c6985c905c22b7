use emtcp::cli::initialize_from_arguments;

/// Without arguments, main runs the default transfer scenario
#[tokio::main]
async fn main() {
    println!("emtcp v{}", env!("CARGO_PKG_VERSION"));
    initialize_from_arguments().await;
    println!("Done");
}
