use std::process::ExitCode;

use clap::Parser;
use kuser::{
    args::{Command, KuserArgs, VerifyArgs},
    commands::{self, Outcome},
    control_plane::kubernetes::KubeControlPlane,
    error::KuserResult,
};

#[cfg(unix)]
extern crate libc;

async fn execute(args: &KuserArgs) -> KuserResult<Outcome> {
    match &args.command {
        Command::CreateIdentity(identity) => commands::create_identity(&args.cluster, identity),
        Command::VerifyAccess(VerifyArgs {
            kubeconfig: Some(path),
            ..
        }) => {
            let cp = KubeControlPlane::from_kubeconfig(path, &args.cluster).await?;
            commands::run(&cp, &args.cluster, &args.command).await
        }
        command => {
            let cp = KubeControlPlane::connect(&args.cluster).await?;
            commands::run(&cp, &args.cluster, command).await
        }
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    #[cfg(unix)]
    {
        unsafe {
            // Kubeconfigs are printed to stdout. Die quietly when
            // the reading end of the pipe goes away.
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }
    }
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    let args = KuserArgs::parse();

    let result = tokio::select! {
        res = execute(&args) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted. Resources created so far are left in place.");
            return ExitCode::from(130);
        }
    };
    match result {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}
