pub mod auth;
pub mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use log::info;
use stun_server_core::{Authenticator, ServerConfig, Supervisor};

use crate::auth::StaticCredentials;
use crate::config::Config;

/// Builds a [`ServerConfig`] and [`Authenticator`] from the parsed process
/// `Config`, then drives a [`Supervisor`] through its full lifecycle. Blocks
/// until `stop` is signalled by the caller-provided future/condition —
/// here, simply until the process receives SIGINT/SIGTERM.
pub fn server_main(config: Arc<Config>) -> Result<()> {
    ensure!(
        !config.is_full_mode || (config.endpoints.addr_pa.is_some() && config.endpoints.addr_ap.is_some() && config.endpoints.addr_aa.is_some()),
        "is_full_mode requires addr_pa, addr_ap and addr_aa to be configured"
    );

    let server_config = ServerConfig {
        addr_pp: config.endpoints.addr_pp,
        addr_pa: config.endpoints.addr_pa,
        addr_ap: config.endpoints.addr_ap,
        addr_aa: config.endpoints.addr_aa,
        advertised_primary: config.endpoints.addr_primary_advertised,
        advertised_alternate: config.endpoints.addr_alternate_advertised,
        is_full_mode: config.is_full_mode,
        tcp: config.tcp,
        reuse_addr: config.reuse_addr,
        enable_dos_protection: config.enable_dos_protection,
        rate_limit_threshold: config.rate_limit_threshold,
        rate_limit_window: Duration::from_secs(config.rate_limit_window_secs),
        rate_limit_capacity: config.rate_limit_capacity,
        threading_per_socket: config.threading_per_socket,
        realm: config.realm.clone(),
        max_connections: config.max_connections,
    };

    let auth: Arc<dyn Authenticator> = Arc::new(StaticCredentials::new(
        config.realm.clone(),
        config.auth.iter().map(|(k, v)| (k.clone(), v.clone())),
    ));

    let mut supervisor = Supervisor::new();
    supervisor.initialize(&server_config, Some(auth))?;
    supervisor.start()?;

    info!("listening on {}", server_config.addr_pp);
    wait_for_shutdown_signal();

    supervisor.stop()?;
    supervisor.shutdown()?;
    Ok(())
}

fn wait_for_shutdown_signal() {
    let (tx, rx) = std::sync::mpsc::channel();

    let result = ctrlc_handler(move || {
        let _ = tx.send(());
    });

    if result.is_err() {
        log::warn!("failed to install Ctrl-C handler; server will run until killed");
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }

    let _ = rx.recv();
}

/// Minimal SIGINT/SIGTERM trap without pulling in a signal-handling crate
/// the rest of the stack doesn't otherwise need: parks a thread on
/// `libc::sigwait` over a blocked signal set.
fn ctrlc_handler(on_signal: impl FnOnce() + Send + 'static) -> Result<()> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);

        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            anyhow::bail!("pthread_sigmask failed");
        }

        std::thread::spawn(move || {
            let mut signal: libc::c_int = 0;
            libc::sigwait(&set, &mut signal);
            on_signal();
        });
    }

    Ok(())
}
