use std::process::Command;

#[test]
fn fails_without_jwt_secret() {
    let exe = env!("CARGO_BIN_EXE_pitchscope");
    let output = Command::new(exe)
        .env_remove("JWT_SECRET")
        .env_remove("DATABASE_URL")
        .output()
        .expect("failed to run pitchscope binary");
    assert!(!output.status.success());
}
