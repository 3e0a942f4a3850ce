mod config;
mod error;
mod http;
mod kerberos;
mod logger;
mod relay;
mod tunnel;

use std::process::ExitCode;

use clap::Parser;
use tokio::runtime;
use tracing::{error, info, warn};

use config::TunnelArgs;
use error::TunnelError;
use kerberos::{SpnegoNegotiator, service_principal};

fn main() -> ExitCode {
    let args = TunnelArgs::parse();

    if let Err(err) = logger::init(args.verbose) {
        eprintln!("{:#}", err);
        return ExitCode::FAILURE;
    }

    let rt = match runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(run(args));
    // a pending stdin read would otherwise keep the runtime alive
    rt.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: TunnelArgs) -> Result<(), TunnelError> {
    let spn = service_principal(&args.service, args.proxy.host());
    let target = args.target.to_string();
    info!(proxy = %args.proxy, destination = %target, spn = %spn, "opening tunnel");

    let proxy_stream = tunnel::connect_proxy(&args.proxy).await?;

    let mut negotiator = SpnegoNegotiator::new();
    let established =
        tunnel::establish(proxy_stream, &mut negotiator, &spn, &target, args.max_rounds).await?;

    info!(rounds = established.rounds, "tunnel established");
    if !established.is_success() {
        warn!(
            status = established.status,
            reason = %established.reason,
            "proxy did not accept the tunnel, relaying its response anyway"
        );
    }

    relay::relay(established.stream, tokio::io::stdin(), tokio::io::stdout()).await;
    Ok(())
}
