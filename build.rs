fn main() {
    cc::Build::new()
        .file("c_src/cond_wait_shim.c")
        .compile("skinny_cond_wait_shim");
    println!("cargo:rerun-if-changed=c_src/cond_wait_shim.c");
}
