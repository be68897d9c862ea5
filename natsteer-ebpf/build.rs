use which::which;

/// Building this crate requires `bpf-linker`.
fn main() {
    if which("bpf-linker").is_err() {
        panic!("bpf-linker not found; install it with `cargo install bpf-linker`");
    }
    println!("cargo:rerun-if-changed=src");
}
