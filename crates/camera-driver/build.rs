//! Build script for the camera driver
//!
//! With the `ffi` feature, compiles the capability shim against the vendor
//! SDK headers and links `libMVSDK`. `MVSDK_DIR` points at the SDK root
//! (containing `include/` and `lib/`), default `../../mvsdk`.

fn main() {
    println!("cargo:rerun-if-changed=csrc/");
    println!("cargo:rerun-if-env-changed=MVSDK_DIR");

    if std::env::var_os("CARGO_FEATURE_FFI").is_none() {
        return;
    }

    let sdk_dir = std::env::var("MVSDK_DIR").unwrap_or_else(|_| "../../mvsdk".to_string());

    cc::Build::new()
        .include(format!("{}/include", sdk_dir))
        .file("csrc/mvsdk_shim.c")
        .warnings(true)
        .compile("mvsdk_shim");

    println!("cargo:rustc-link-search=native={}/lib", sdk_dir);

    #[cfg(target_os = "macos")]
    println!("cargo:rustc-link-lib=dylib=mvsdk");

    #[cfg(not(target_os = "macos"))]
    println!("cargo:rustc-link-lib=dylib=MVSDK");
}
