use std::{env, path::PathBuf};

fn main() {
    println!("cargo::rustc-check-cfg=cfg(embedded_object)");
    println!("cargo::rerun-if-env-changed=PORTDROP_EBPF_OBJECT");

    // The filter object is built outside this workspace. When its path is
    // given at build time it is bundled into the binary.
    if let Some(object) = env::var_os("PORTDROP_EBPF_OBJECT") {
        let object = PathBuf::from(object);
        let object = object.canonicalize().unwrap_or(object);
        println!("cargo::rustc-cfg=embedded_object");
        println!(
            "cargo::rustc-env=PORTDROP_EMBEDDED_OBJECT={}",
            object.display()
        );
        println!("cargo::rerun-if-changed={}", object.display());
    }
}
