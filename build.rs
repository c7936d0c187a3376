use std::env;

fn main() {
    // The nflog capture engine binds to the kernel netfilter log interface
    // through libnetfilter_log, which in turn needs libnfnetlink.
    println!("cargo:rustc-link-lib=netfilter_log");
    println!("cargo:rustc-link-lib=nfnetlink");

    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("linux") {
        println!("cargo:rustc-link-search=/usr/lib/x86_64-linux-gnu");
        println!("cargo:rustc-link-search=/usr/lib");
        println!("cargo:rustc-link-search=/usr/local/lib");
    }
}
