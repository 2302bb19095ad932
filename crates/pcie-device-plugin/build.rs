fn main() -> Result<(), Box<dyn std::error::Error>> {
    // use the bundled protoc unless the environment already points at one
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        // the client side of DevicePlugin is used by the socket self-check and the tests
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/api.proto");
    Ok(())
}
