//! Build script to generate C header using cbindgen

fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    let Ok(crate_dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let output_dir = std::path::Path::new(&crate_dir).join("..").join("..").join("include");

    if let Err(e) = std::fs::create_dir_all(&output_dir) {
        println!("cargo:warning=cannot create {}: {e}", output_dir.display());
        return;
    }

    let config = cbindgen::Config::from_file("cbindgen.toml").unwrap_or_default();

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(output_dir.join("fett.h"));
        }
        Err(e) => println!("cargo:warning=fett.h not generated: {e}"),
    }
}
