use std::net::SocketAddr;
use std::os::unix::net::UnixDatagram;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::info;

use crate::dispatch::{shutdown_pipe, signal_shutdown, DispatchLoop, LoopContext};
use crate::endpoint::{Endpoint, TransportAddressSet};
use crate::error::CoreError;
use crate::handler::{Authenticator, NoopAuthenticator};
use crate::rate_limiter::RateLimiter;
use crate::role::Role;
use crate::socket_set::{SocketSet, Transport};

/// Everything `Supervisor::initialize` needs to construct the TSA, socket
/// set and rate limiter. A pure data carrier — no behavior of its own.
pub struct ServerConfig {
    pub addr_pp: SocketAddr,
    pub addr_pa: Option<SocketAddr>,
    pub addr_ap: Option<SocketAddr>,
    pub addr_aa: Option<SocketAddr>,
    pub advertised_primary: std::net::IpAddr,
    pub advertised_alternate: Option<std::net::IpAddr>,
    pub is_full_mode: bool,
    pub tcp: bool,
    pub reuse_addr: bool,
    pub enable_dos_protection: bool,
    pub rate_limit_threshold: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_capacity: usize,
    pub threading_per_socket: u32,
    pub realm: String,
    /// TCP only: cap on streams any one dispatch loop holds accepted at
    /// once. `0` means unlimited.
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninit,
    Initialized,
    Running,
    Stopped,
}

struct RunningLoops {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: Vec<UnixDatagram>,
}

/// Orchestrates the whole server lifecycle: `Uninit -> Initialized ->
/// Running -> Stopped`. Transitions other than forward are rejected.
pub struct Supervisor {
    state: State,
    ctx: Option<Arc<LoopContext>>,
    threading_per_socket: u32,
    running: Mutex<Option<RunningLoops>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            state: State::Uninit,
            ctx: None,
            threading_per_socket: 0,
            running: Mutex::new(None),
        }
    }

    pub fn initialize(&mut self, config: &ServerConfig, auth: Option<Arc<dyn Authenticator>>) -> Result<(), CoreError> {
        if self.state != State::Uninit {
            return Err(CoreError::Unexpected("initialize called outside Uninit state"));
        }

        let tsa = build_tsa(config)?;
        let transport = if config.tcp { Transport::Tcp } else { Transport::Udp };
        let sockets = SocketSet::bind(&tsa, transport, config.reuse_addr)?;

        let limiter = if config.enable_dos_protection {
            Some(Arc::new(RateLimiter::new(
                config.rate_limit_threshold,
                config.rate_limit_window,
                config.rate_limit_capacity,
            )))
        } else {
            None
        };

        let auth = auth.unwrap_or_else(|| Arc::new(NoopAuthenticator));

        self.ctx = Some(Arc::new(LoopContext::new(
            Arc::new(sockets),
            Arc::new(tsa),
            auth,
            limiter,
            config.max_connections,
        )));

        self.threading_per_socket = config.threading_per_socket;
        self.state = State::Initialized;
        Ok(())
    }

    /// Spawns one loop per role under the `k=0` (single-loop-multi-socket)
    /// or `k>0` (k loops per role, single-socket mode) placement model and
    /// returns once every loop has been spawned.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.state != State::Initialized {
            return Err(CoreError::Unexpected("start called outside Initialized state"));
        }

        let ctx = self.ctx.clone().expect("ctx set during initialize");
        let tcp = ctx.sockets.transport() == Transport::Tcp;
        let mut handles = Vec::new();
        let mut shutdown_tx = Vec::new();
        let mut ready_rx = Vec::new();

        let role_groups: Vec<Vec<Role>> = if self.threading_per_socket == 0 {
            vec![ctx.tsa.valid_roles().collect()]
        } else {
            ctx.tsa
                .valid_roles()
                .flat_map(|r| std::iter::repeat(vec![r]).take(self.threading_per_socket as usize))
                .collect()
        };

        for roles in role_groups {
            let (tx, rx) =
                shutdown_pipe().map_err(|e| CoreError::ConfigInvalid(format!("shutdown pipe creation failed: {e}")))?;
            let ctx = ctx.clone();
            let (ready_tx, this_ready_rx) = std::sync::mpsc::channel::<()>();

            let handle = std::thread::Builder::new()
                .name(format!("stun-dispatch-{:?}", roles))
                .spawn(move || {
                    let mut dispatch = DispatchLoop::new(ctx, roles, rx);
                    let _ = ready_tx.send(());
                    if tcp {
                        dispatch.run_tcp();
                    } else {
                        dispatch.run();
                    }
                })
                .expect("spawning a dispatch thread should not fail under normal resource limits");

            handles.push(handle);
            shutdown_tx.push(tx);
            ready_rx.push(this_ready_rx);
        }

        for rx in ready_rx {
            let _ = rx.recv();
        }

        *self.running.lock().unwrap() = Some(RunningLoops { handles, shutdown_tx });
        self.state = State::Running;
        info!("stun server started with {} dispatch loop(s)", self.running.lock().unwrap().as_ref().unwrap().handles.len());
        Ok(())
    }

    /// Signals every loop to exit and joins them. Returns only after all
    /// loops have stopped processing.
    pub fn stop(&mut self) -> Result<(), CoreError> {
        if self.state != State::Running {
            return Err(CoreError::Unexpected("stop called outside Running state"));
        }

        if let Some(running) = self.running.lock().unwrap().take() {
            for tx in &running.shutdown_tx {
                signal_shutdown(tx);
            }
            for handle in running.handles {
                let _ = handle.join();
            }
        }

        self.state = State::Stopped;
        info!("stun server stopped");
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<(), CoreError> {
        if self.state == State::Running {
            self.stop()?;
        }

        self.ctx = None;
        Ok(())
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn build_tsa(config: &ServerConfig) -> Result<TransportAddressSet, CoreError> {
    let alt_ip = config.advertised_alternate.unwrap_or(config.advertised_primary);

    let pp = Endpoint {
        role: Role::Pp,
        bind_addr: config.addr_pp,
        advertised_ip: config.advertised_primary,
        valid: true,
    };

    let pa = Endpoint {
        role: Role::Pa,
        bind_addr: config.addr_pa.unwrap_or(config.addr_pp),
        advertised_ip: config.advertised_primary,
        valid: config.is_full_mode && config.addr_pa.is_some(),
    };

    let ap = Endpoint {
        role: Role::Ap,
        bind_addr: config.addr_ap.unwrap_or(config.addr_pp),
        advertised_ip: alt_ip,
        valid: config.is_full_mode && config.addr_ap.is_some(),
    };

    let aa = Endpoint {
        role: Role::Aa,
        bind_addr: config.addr_aa.unwrap_or(config.addr_pp),
        advertised_ip: alt_ip,
        valid: config.is_full_mode && config.addr_aa.is_some(),
    };

    if config.is_full_mode && !(pa.valid && ap.valid && aa.valid) {
        return Err(CoreError::ConfigInvalid(
            "full mode requires addr_pa, addr_ap and addr_aa to all be set".into(),
        ));
    }

    TransportAddressSet::new([pp, pa, ap, aa])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_config(port: u16) -> ServerConfig {
        ServerConfig {
            addr_pp: format!("127.0.0.1:{port}").parse().unwrap(),
            addr_pa: None,
            addr_ap: None,
            addr_aa: None,
            advertised_primary: "127.0.0.1".parse().unwrap(),
            advertised_alternate: None,
            is_full_mode: false,
            tcp: false,
            reuse_addr: true,
            enable_dos_protection: false,
            rate_limit_threshold: 0,
            rate_limit_window: Duration::from_secs(1),
            rate_limit_capacity: 0,
            threading_per_socket: 1,
            realm: "test".into(),
            max_connections: 0,
        }
    }

    #[test]
    fn rejects_start_before_initialize() {
        let mut supervisor = Supervisor::new();
        assert!(supervisor.start().is_err());
    }

    #[test]
    fn rejects_double_initialize() {
        let mut supervisor = Supervisor::new();
        let config = basic_config(38478);
        supervisor.initialize(&config, None).unwrap();
        assert!(supervisor.initialize(&config, None).is_err());
    }

    #[test]
    fn start_stop_lifecycle_on_basic_mode() {
        let mut supervisor = Supervisor::new();
        let config = basic_config(38479);
        supervisor.initialize(&config, None).unwrap();
        supervisor.start().unwrap();
        supervisor.stop().unwrap();
    }
}
