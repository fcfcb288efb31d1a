//! Build script for pipekit-codec.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=NVPIPE_LIB_DIR");

    if std::env::var_os("CARGO_FEATURE_NVPIPE").is_none() {
        return;
    }

    match std::env::var("NVPIPE_LIB_DIR") {
        Ok(dir) => println!("cargo:rustc-link-search=native={dir}"),
        Err(_) => println!(
            "cargo:warning=NVPIPE_LIB_DIR is unset; relying on the default linker search path for NvPipe"
        ),
    }
}
