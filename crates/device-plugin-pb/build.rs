fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The registration server is generated too, tests stand in for the kubelet with it
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    Ok(())
}
