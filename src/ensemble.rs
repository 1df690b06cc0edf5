//! Ensemble providers: where the current server set comes from

/// Supplies the connection string for every (re)connect.
///
/// The reconnect loop re-reads the provider each time it dials, so a
/// dynamically refreshed implementation takes effect on the next attempt
/// without restarting the client.
pub trait EnsembleProvider: Send + Sync {
    fn connection_string(&self) -> String;
}

/// The default provider: a fixed connection string.
#[derive(Debug, Clone)]
pub struct FixedEnsembleProvider {
    connect_string: String,
}

impl FixedEnsembleProvider {
    pub fn new(connect_string: &str) -> Self {
        Self {
            connect_string: connect_string.to_string(),
        }
    }
}

impl EnsembleProvider for FixedEnsembleProvider {
    fn connection_string(&self) -> String {
        self.connect_string.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_provider_returns_configured_string() {
        let provider = FixedEnsembleProvider::new("10.0.0.5:2181,10.0.0.6:2181");
        assert_eq!(provider.connection_string(), "10.0.0.5:2181,10.0.0.6:2181");
    }
}
