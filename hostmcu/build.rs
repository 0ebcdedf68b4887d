fn main() {
    keel_codegen::ConfigBuilder::new()
        .entry("src/main.rs")
        .set_version(concat!("hostmcu ", env!("CARGO_PKG_VERSION")))
        .set_build_versions(concat!("rustc: ", env!("CARGO_PKG_RUST_VERSION")))
        .build()
}
