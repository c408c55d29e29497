fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    let protos = [
        "proto/carisma/node/v1/node.proto",
        "proto/carisma/service/v1/service.proto",
        "proto/carisma/xds/v1/xds.proto",
    ];

    for proto in &protos {
        println!("cargo:rerun-if-changed={}", proto);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&protos, &["proto"])?;

    Ok(())
}
