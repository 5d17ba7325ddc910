#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = ledgerd_node::run_entry().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
