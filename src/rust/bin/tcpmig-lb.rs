// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::clap::{
    Arg,
    ArgMatches,
    Command,
};
use ::log::{
    error,
    info,
};
use ::std::{
    sync::Arc,
    thread::{
        self,
        JoinHandle,
    },
};
use ::tcpmig_lb::{
    runtime::{
        clock::{
            Clock,
            SystemClock,
        },
        logging,
    },
    Config,
    Fail,
    LbNetwork,
    LoadBalancer,
    MessageBus,
};

//==============================================================================
// Constants
//==============================================================================

const DEFAULT_CONFIG_PATH: &str = "./config.yml";

//==============================================================================
// main()
//==============================================================================

pub fn main() -> Result<()> {
    logging::initialize();

    let matches: ArgMatches = Command::new("tcpmig-lb")
        .about("IPv6 TCP load balancer with live connection handoff")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("path of configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();
    let path: &str = matches.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH);

    let config: Config = Config::from_file(path)?;
    info!("loaded {} backend(s) from {}", config.backends.len(), path);

    let network: Arc<LbNetwork> = Arc::new(LbNetwork::new(&config.lb_network)?);
    let bus: Arc<dyn MessageBus> = network.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let lbs: Vec<Arc<LoadBalancer>> = config
        .backends
        .iter()
        .map(|backend| {
            LoadBalancer::new(
                backend.clone(),
                &config.lb_network.commands,
                config.migration.clone(),
                bus.clone(),
                clock.clone(),
            )
        })
        .collect();

    // Fail before serving anything if a listener or capture cannot be set up.
    for lb in &lbs {
        lb.bind()?;
        lb.start_capture()?;
    }

    {
        let lbs: Vec<Arc<LoadBalancer>> = lbs.clone();
        ctrlc::set_handler(move || {
            info!("received Ctrl-C signal, shutting down");
            for lb in &lbs {
                lb.shutdown();
            }
        })?;
    }

    let listeners: Vec<JoinHandle<Result<(), Fail>>> = lbs
        .iter()
        .map(|lb| {
            let lb: Arc<LoadBalancer> = lb.clone();
            thread::spawn(move || lb.start_listen())
        })
        .collect();
    for listener in listeners {
        match listener.join() {
            Ok(Ok(())) => (),
            Ok(Err(e)) => error!("listener failed: {}", e),
            Err(_) => error!("listener thread panicked"),
        }
    }
    network.shutdown();

    cfg_if::cfg_if! {
        if #[cfg(feature = "profiler")] {
            tcpmig_lb::profiler::write_profiler_data(&mut std::io::stderr())?;
        }
    }

    Ok(())
}
