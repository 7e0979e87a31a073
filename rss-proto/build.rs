fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile_protos(&["proto/rss.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/rss.proto");
    Ok(())
}
