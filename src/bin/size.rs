//! The built-in `size` analyzer binary.
//!
//! Launched by the treport host; speaks the analyzer protocol on stdio, so
//! all of its own logging goes to stderr.

use anyhow::Result;
use treport::plugin::serve::serve;
use treport::plugin::size::SizeScanner;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("size=debug")
        .with_writer(std::io::stderr)
        .init();

    serve(SizeScanner).await
}
