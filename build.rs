use std::env;

fn main() {
    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("windows") {
        panic!("greenrt requires a unix target (linux or macos)");
    }
    let mut build = cc::Build::new();
    if target.contains("apple") {
        if target.contains("aarch64") || target.contains("arm64") {
            build.file("ctx_arm64_macos.asm");
        } else {
            build.file("ctx_x86_64_macos.asm");
        }
    } else if target.contains("aarch64") || target.contains("arm64") {
        build.file("ctx_arm64.asm");
    } else {
        build.file("ctx_x86_64_sysv.asm");
    }
    build.flag("-x").flag("assembler");
    build.flag_if_supported("-Qunused-arguments");
    build.compile("grtctx");
}
