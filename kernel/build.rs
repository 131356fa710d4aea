fn main() {
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap();
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();

    // Host builds (unit tests) link normally.
    if os == "none" {
        // Tell cargo to pass the linker script to the linker..
        println!("cargo:rustc-link-arg-bins=-T{manifest_dir}/src/arch/{arch}/linker.ld");
    }
    // ..and to re-run if it changes.
    println!("cargo:rerun-if-changed=src/arch/{arch}/linker.ld");
}
