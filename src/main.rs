use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use nix::unistd::{getegid, geteuid};
use rpi_gpio_server::config::Args;
use rpi_gpio_server::event::soft_interrupt;
use rpi_gpio_server::server::{
    drop_privileges, DeviceServer, Identity, InterruptSource, Listener, ServerConfig,
};

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.log_level())
        .parse_default_env()
        .init();

    // A simulated board has no interrupt line; keep the software one open.
    let (interrupt, _trigger) = if args.simulate {
        let (line, trigger) = soft_interrupt();
        (InterruptSource::Line(Box::new(line)), Some(trigger))
    } else {
        (InterruptSource::Uio(args.interrupt.clone()), None)
    };

    let mut server = DeviceServer::start(ServerConfig {
        device: args.device(),
        interrupt,
        priority: args.priority,
        root_mode: args.mode,
        hardware_timeout: args.hardware_timeout(),
    })
    .context("failed to start the GPIO server")?;

    let listener = Listener::bind(&args.mount)
        .with_context(|| format!("failed to serve on {}", args.mount.display()))?;

    if let Some(user) = &args.user {
        let identity = Identity::parse(user).context("invalid --user")?;
        drop_privileges(identity).context("failed to drop privileges")?;
    }
    server.set_owner(geteuid().as_raw(), getegid().as_raw());

    info!("accepting clients on {}", listener.path().display());
    listener.serve(&mut server).context("serving loop failed")?;
    Ok(())
}
