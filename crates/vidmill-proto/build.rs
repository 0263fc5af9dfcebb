fn main() -> Result<(), Box<dyn std::error::Error>> {
    let file_descriptors = protox::compile(["proto/vidmill/v1/engine.proto"], ["proto"])?;
    tonic_build::configure().compile_fds(file_descriptors)?;
    println!("cargo:rerun-if-changed=proto/vidmill/v1/engine.proto");
    Ok(())
}
