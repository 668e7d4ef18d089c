//! Client configuration (spec §6). Builder-style assembly, in the
//! teacher's `configuration::builder` idiom, of the options every
//! component reads.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RetryOptions {
    pub retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub subscribe_cooldown: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: 5,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            subscribe_cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SynchronizationThrottlerOptions {
    pub max_concurrent_synchronizations: usize,
    pub queue_timeout: Duration,
}

impl Default for SynchronizationThrottlerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_synchronizations: 15,
            queue_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub application: String,
    pub domain: String,
    pub region: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry_opts: RetryOptions,
    pub packet_ordering_timeout: Duration,
    pub use_shared_client_api: bool,
    pub unsubscribe_throttling_interval: Duration,
    pub synchronization_throttler: SynchronizationThrottlerOptions,
    pub packet_logger_enabled: bool,
    pub max_accounts_per_instance: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            application: "MetaApi".to_string(),
            domain: "agiliumtrade.agiliumtrade.ai".to_string(),
            region: None,
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(60),
            retry_opts: RetryOptions::default(),
            packet_ordering_timeout: Duration::from_secs(60),
            use_shared_client_api: false,
            unsubscribe_throttling_interval: Duration::from_secs(10),
            synchronization_throttler: SynchronizationThrottlerOptions::default(),
            packet_logger_enabled: false,
            max_accounts_per_instance: 100,
        }
    }
}

#[derive(Default)]
pub struct ClientOptionsBuilder {
    opts: ClientOptions,
}

impl ClientOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn application(mut self, application: impl Into<String>) -> Self {
        self.opts.application = application.into();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.opts.domain = domain.into();
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.opts.region = Some(region.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.opts.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.opts.connect_timeout = timeout;
        self
    }

    pub fn retry_opts(mut self, retry_opts: RetryOptions) -> Self {
        self.opts.retry_opts = retry_opts;
        self
    }

    pub fn packet_ordering_timeout(mut self, timeout: Duration) -> Self {
        self.opts.packet_ordering_timeout = timeout;
        self
    }

    pub fn use_shared_client_api(mut self, shared: bool) -> Self {
        self.opts.use_shared_client_api = shared;
        self
    }

    pub fn unsubscribe_throttling_interval(mut self, interval: Duration) -> Self {
        self.opts.unsubscribe_throttling_interval = interval;
        self
    }

    pub fn synchronization_throttler(mut self, opts: SynchronizationThrottlerOptions) -> Self {
        self.opts.synchronization_throttler = opts;
        self
    }

    pub fn packet_logger_enabled(mut self, enabled: bool) -> Self {
        self.opts.packet_logger_enabled = enabled;
        self
    }

    pub fn build(self) -> ClientOptions {
        self.opts
    }
}
