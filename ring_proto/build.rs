fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    tonic_build::configure()
        .type_attribute(".ring", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile_protos(&["proto/ring.proto"], &["proto"])?;
    Ok(())
}
