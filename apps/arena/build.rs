use chrono::Utc;

fn main() {
    let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    println!("cargo:rustc-env=ARENA_BUILD_TIMESTAMP={stamp}");
    println!("cargo:rerun-if-changed=build.rs");
}
