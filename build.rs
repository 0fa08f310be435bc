use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Put the linker script somewhere the linker can find it and assemble the
/// context switch when building for the RISC-V port.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if target_arch != "riscv64" {
        // Host builds use the simulation port only.
        return;
    }

    let out_dir = env::var("OUT_DIR").expect("No out dir");
    let dest_path = Path::new(&out_dir);
    let mut f = File::create(dest_path.join("memory.x")).expect("Could not create file");

    f.write_all(include_bytes!("memory.x"))
        .expect("Could not write file");

    println!("cargo:rustc-link-search={}", dest_path.display());
    println!("cargo:rerun-if-changed=memory.x");

    // ========================================================================
    // Context switch assembly
    // ========================================================================

    println!("cargo:rerun-if-changed=src/arch/switch.S");

    cc::Build::new()
        .file("src/arch/switch.S")
        .flag("-march=rv64imac")
        .flag("-mabi=lp64")
        .compile("context_switch");
}
