use crate::policy::NotifyClass;
use anyhow::Context;
use cidr::AnyIpCidr;
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// A set of CIDR blocks, deserialized from a list of strings
/// such as `["127.0.0.1", "10.0.0.0/8"]`
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct CidrSet(Vec<AnyIpCidr>);

impl CidrSet {
    pub fn new(entries: Vec<AnyIpCidr>) -> Self {
        Self(entries)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.0.iter().any(|cidr| cidr.contains(&ip))
    }
}

impl FromIterator<AnyIpCidr> for CidrSet {
    fn from_iter<I: IntoIterator<Item = AnyIpCidr>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SaslConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "SaslConfig::default_mechanisms")]
    pub mechanisms: Vec<String>,
}

impl SaslConfig {
    fn default_mechanisms() -> Vec<String> {
        vec!["PLAIN".to_string(), "LOGIN".to_string()]
    }
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mechanisms: Self::default_mechanisms(),
        }
    }
}

/// Server-wide settings consulted by each session. Immutable once
/// loaded; share it between sessions via `Arc`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SmtpdConfig {
    /// Our own hostname, used when talking about ourselves
    #[serde(default = "SmtpdConfig::default_hostname")]
    pub hostname: String,

    /// The user that owns the mail system. A locally submitted
    /// session running as any other user is a standalone session.
    #[serde(default = "SmtpdConfig::default_owner_uid")]
    pub owner_uid: u32,

    /// Where to send mail before it is queued, eg: `127.0.0.1:10025`.
    /// An empty string is the same as not setting it.
    #[serde(default)]
    pub proxy_filter: Option<String>,

    /// Peers that are allowed to use XFORWARD
    #[serde(default = "SmtpdConfig::default_xforward_hosts")]
    pub xforward_hosts: CidrSet,

    /// The code used when a verdict is converted into a temporary failure
    #[serde(
        default = "SmtpdConfig::default_defer_code",
        deserialize_with = "deserialize_defer_code"
    )]
    pub defer_code: u16,

    /// Upper bound on how long peer name resolution may take
    #[serde(
        default = "SmtpdConfig::default_peer_lookup_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub peer_lookup_timeout: Duration,

    /// Which classes of error are reported to the postmaster
    #[serde(
        default = "SmtpdConfig::default_notify_classes",
        deserialize_with = "deserialize_notify_classes"
    )]
    pub notify_classes: NotifyClass,

    #[serde(default)]
    pub sasl: SaslConfig,
}

impl Default for SmtpdConfig {
    fn default() -> Self {
        Self {
            hostname: Self::default_hostname(),
            owner_uid: Self::default_owner_uid(),
            proxy_filter: None,
            xforward_hosts: Self::default_xforward_hosts(),
            defer_code: Self::default_defer_code(),
            peer_lookup_timeout: Self::default_peer_lookup_timeout(),
            notify_classes: Self::default_notify_classes(),
            sasl: SaslConfig::default(),
        }
    }
}

impl SmtpdConfig {
    fn default_hostname() -> String {
        gethostname::gethostname()
            .to_str()
            .unwrap_or("localhost")
            .to_string()
    }

    /// Same uid source as [ProcessIdentity::current](crate::transport::ProcessIdentity::current)
    fn default_owner_uid() -> u32 {
        nix::unistd::getuid().as_raw()
    }

    fn default_xforward_hosts() -> CidrSet {
        ["127.0.0.1", "::1"]
            .into_iter()
            .filter_map(|s| AnyIpCidr::from_str(s).ok())
            .collect()
    }

    fn default_defer_code() -> u16 {
        450
    }

    fn default_peer_lookup_timeout() -> Duration {
        Duration::from_secs(10)
    }

    fn default_notify_classes() -> NotifyClass {
        NotifyClass::RESOURCE | NotifyClass::SOFTWARE
    }

    /// The proxy filter, if one is configured
    pub fn proxy_target(&self) -> Option<&str> {
        self.proxy_filter.as_deref().filter(|s| !s.is_empty())
    }

    /// Returns true if `ip` may override the client identity
    /// with XFORWARD
    pub fn is_xforward_host(&self, ip: IpAddr) -> bool {
        self.xforward_hosts.contains(ip)
    }

    pub fn from_toml_str(data: &str) -> anyhow::Result<Self> {
        toml::from_str(data).context("parsing smtpd config")
    }

    /// Load the configuration from a file. `.json` files are
    /// parsed as JSON, everything else as TOML.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("loading data from file {}", path.display()))?;

        let config = if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            serde_json::from_str(&data)
                .with_context(|| format!("parsing json from file {}", path.display()))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("parsing toml from file {}", path.display()))?
        };
        tracing::debug!("loaded smtpd config from {}", path.display());
        Ok(config)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Seconds(u64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match DurationValue::deserialize(deserializer)? {
        DurationValue::Seconds(secs) => Ok(Duration::from_secs(secs)),
        DurationValue::Text(text) => humantime::parse_duration(&text).map_err(|err| {
            serde::de::Error::custom(format!("invalid duration {text:?}: {err:#}"))
        }),
    }
}

fn deserialize_defer_code<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let code = u16::deserialize(deserializer)?;
    if !(400..500).contains(&code) {
        return Err(serde::de::Error::custom(format!(
            "defer_code must be a 4xx code, got {code}"
        )));
    }
    Ok(code)
}

fn deserialize_notify_classes<'de, D>(deserializer: D) -> Result<NotifyClass, D::Error>
where
    D: Deserializer<'de>,
{
    let names = Vec::<String>::deserialize(deserializer)?;
    let mut classes = NotifyClass::empty();
    for name in names {
        classes |= NotifyClass::parse_name(&name).ok_or_else(|| {
            serde::de::Error::custom(format!("unknown notify class {name:?}"))
        })?;
    }
    Ok(classes)
}
