use chrono::Utc;

fn main() {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    println!("cargo:rustc-env=WEBSHELL_BUILD_TIMESTAMP={timestamp}");

    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=WEBSHELL_BUILD_PROFILE={profile}");

    println!("cargo:rerun-if-changed=build.rs");
    // Source edits should refresh the version stamp too.
    println!("cargo:rerun-if-changed=src/");
}
