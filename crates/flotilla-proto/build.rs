fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("bundled protoc binary"),
    );

    tonic_build::configure().compile_protos(
        &[
            "proto/control.proto",
            "proto/dispatcher.proto",
            "proto/ca.proto",
            "proto/raft.proto",
        ],
        &["proto"],
    )?;

    println!("cargo:rerun-if-changed=proto");
    Ok(())
}
