use std::process::ExitCode;

fn main() -> ExitCode {
    presence_relay_lib::run()
}
