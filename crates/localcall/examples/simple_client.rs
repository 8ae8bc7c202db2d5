//! Minimal client for the `example` service.
//!
//! Start `cargo run --example simple_server` first.

use localcall::ServiceCaller;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let caller = ServiceCaller::new("example")?;

    let request = "hello, whats your name?";
    println!("[client] sending {request:?} ...");
    let reply = caller.call(request.as_bytes()).await?;
    println!("[client] received {:?}", String::from_utf8_lossy(&reply));

    Ok(())
}
