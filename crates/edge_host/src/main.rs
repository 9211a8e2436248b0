#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    lib_edge_host::init().await
}
