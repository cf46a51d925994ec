fn main() {
    println!("cargo:rerun-if-changed=src/protos/chromeos_update_engine/update_metadata.proto");

    // Compile protobuf files. protox parses them in-process so no protoc
    // binary is needed on the build host.
    let file_descriptors = protox::compile(
        ["chromeos_update_engine/update_metadata.proto"],
        ["src/protos"],
    )
    .expect("error parsing protobuf files");

    prost_build::Config::new()
        .compile_fds(file_descriptors)
        .expect("error compiling protobuf files");

    // Windows-specific configuration
    #[cfg(target_os = "windows")]
    {
        // Configure static linking for xz2/lzma
        println!("cargo:rustc-link-search=/usr/x86_64-w64-mingw32/lib");
        println!("cargo:rustc-link-search=/usr/mingw64/lib");
        println!("cargo:rustc-link-lib=static=lzma");

        // Force static linking of C runtime
        println!("cargo:rustc-link-arg=-static-libgcc");
        println!("cargo:rustc-link-arg=-static-libstdc++");
    }
}
