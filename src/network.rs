use std::time::Duration;

const PROBE_URL: &str = "https://clients3.google.com/generate_204";
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const PROBE_ATTEMPTS: u32 = 2;

/// Best-effort internet reachability check. Used to decide whether the primary
/// database endpoint and the primary AI provider are worth attempting at all.
#[derive(Clone)]
pub struct ConnectivityProbe {
    client: reqwest::Client,
    probe_url: String,
}

impl ConnectivityProbe {
    pub fn new() -> Self {
        Self::with_url(PROBE_URL.to_string())
    }

    pub fn with_url(probe_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("failed to build probe http client");
        Self { client, probe_url }
    }

    /// Never fails; any error counts as offline.
    pub async fn is_online(&self) -> bool {
        for _ in 0..PROBE_ATTEMPTS {
            match self.client.head(&self.probe_url).send().await {
                Ok(response) if response.status().is_success() => return true,
                _ => {}
            }
        }
        false
    }
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::new()
    }
}
