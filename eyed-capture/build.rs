fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=proto/capture.proto");
    tonic_build::configure()
        .build_server(false)
        .compile_protos(
            &["capture.proto"], // Files in the path
            &["proto"],         // The include path to search
        )
        .unwrap();
}
