use std::time::Duration;

use metrix_agent::Agent;
use metrix_core::{AgentConfig, EnvelopeConfig, Result};
use tokio_util::sync::CancellationToken;

pub struct AgentArgs {
    pub address: String,
    pub poll_interval: u64,
    pub report_interval: u64,
    pub rate_limit: usize,
    pub key: Option<String>,
    pub crypto_key: Option<String>,
}

impl AgentArgs {
    fn into_config(self) -> AgentConfig {
        AgentConfig {
            server_addr: self.address,
            poll_interval: Duration::from_secs(self.poll_interval),
            report_interval: Duration::from_secs(self.report_interval),
            rate_limit: self.rate_limit,
            envelope: EnvelopeConfig {
                sign_key: self.key,
                crypto_key: self.crypto_key,
            },
            ..AgentConfig::default()
        }
    }
}

pub fn run(args: AgentArgs) -> Result<()> {
    let config = args.into_config();
    log::info!(target: "metrix", "metrix agent v{}", metrix_core::VERSION);

    let rt = super::runtime()?;
    rt.block_on(async move {
        let agent = Agent::new(config)?;
        let shutdown = CancellationToken::new();
        super::cancel_on_ctrl_c(shutdown.clone());
        agent.run(shutdown).await;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = AgentArgs {
            address: "localhost:8080".into(),
            poll_interval: 0,
            report_interval: 10,
            rate_limit: 0,
            key: None,
            crypto_key: None,
        }
        .into_config();
        assert!(Agent::new(config).is_err());
    }
}
