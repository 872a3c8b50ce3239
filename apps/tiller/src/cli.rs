use anyhow::{anyhow, Result};
use clap::Parser;
use tiller_core::config::parse_ice_servers;
use tiller_core::Config;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Parser, Debug)]
#[command(name = "tiller")]
#[command(about = "Operator terminal control plane for a remote vehicle")]
pub struct Cli {
    /// Rendezvous Redis server
    #[arg(long, env = "TILLER_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Vehicle id; namespaces every rendezvous topic
    #[arg(long)]
    pub vehicle: Option<String>,

    /// When to start negotiating: `hello` or `connect`
    #[arg(long)]
    pub initiate: Option<String>,

    /// ICE server as `url[|username|credential]`; repeatable, replaces the configured list
    #[arg(long = "ice-server")]
    pub ice_servers: Vec<String>,
}

impl Cli {
    /// Layers command-line flags over the environment configuration.
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(vehicle) = &self.vehicle {
            config.vehicle_id = vehicle.clone();
        }
        if let Some(initiate) = &self.initiate {
            config.initiation = initiate
                .parse()
                .map_err(|_| anyhow!("--initiate must be `hello` or `connect`, got {initiate:?}"))?;
        }
        if !self.ice_servers.is_empty() {
            config.ice_servers = parse_ice_servers(&self.ice_servers.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_core::InitiationPolicy;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "tiller",
            "--vehicle",
            "skiff",
            "--initiate",
            "connect",
            "--ice-server",
            "stun:a.example:3478",
            "--ice-server",
            "turn:b.example:3478|op|pw",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config).unwrap();
        assert_eq!(config.vehicle_id, "skiff");
        assert_eq!(config.initiation, InitiationPolicy::OnConnect);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.topics().signal_out, "tiller/skiff/operator/signal");
    }

    #[test]
    fn bad_policy_is_rejected() {
        let cli = Cli::parse_from(["tiller", "--initiate", "whenever"]);
        assert!(cli.apply(&mut Config::default()).is_err());
    }
}
