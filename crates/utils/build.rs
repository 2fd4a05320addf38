use std::env;

fn main() {
    // outside a git checkout the version falls back to "unknown"
    if let Err(err) = emit_git_variables() {
        println!("cargo:warning=vergen: {err}");
    }

    let image_version = env::var("VERSION").unwrap_or_else(|_| "latest".to_string());
    println!("cargo:rustc-env=IMAGE_VERSION={image_version}");
    println!("cargo:rerun-if-env-changed=VERSION");
}

fn emit_git_variables() -> anyhow::Result<()> {
    let git = vergen_git2::Git2Builder::default()
        .sha(false)
        .dirty(false)
        .build()?;

    vergen_git2::Emitter::default()
        .fail_on_error()
        .add_instructions(&git)?
        .emit()
}
