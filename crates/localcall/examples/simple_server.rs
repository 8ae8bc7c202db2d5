//! Minimal server for the `example` service.
//!
//! Run with: `cargo run --example simple_server`
//! Then, in another terminal: `cargo run --example simple_client`

use localcall::Endpoint;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let endpoint = Endpoint::new()?;
    endpoint.create_service("example", |request: &[u8]| -> Result<Vec<u8>, String> {
        let text = String::from_utf8_lossy(request);
        println!("[server] received request {text:?}");
        println!("[server] sending response \"chris\"");
        Ok(b"chris".to_vec())
    })?;

    println!("[server] ready on service 'example' (Ctrl+C to stop)");
    endpoint.spin().await?;
    Ok(())
}
