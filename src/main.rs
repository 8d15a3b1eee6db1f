fn main() -> std::process::ExitCode {
    db_relay::run()
}
