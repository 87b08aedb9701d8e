use std::process::ExitCode;

mod agent;
mod app;
mod cancel;
mod cli;
mod commands;
mod config;
mod error;
mod fs_util;
mod hooks;
mod logger;
mod pidfile;
mod prd;
mod progress;
mod prompt;
mod run_loop;
mod shell;


fn main() -> ExitCode {
    app::main()
}
