//! Deserialization implementation largely based on the [`envy`] crate.
//!
//! This implementation specifically provides a fix allowing us to use `rename`-type derive macros
//! on a struct, as the [`envy`] crate has not been updated in over a year.
//!
//! [`envy`]: https://github.com/softprops/envy

use std::iter::{IntoIterator, empty};
use std::sync::LazyLock;

use serde::Deserialize;
use serde::de::value::{MapDeserializer, SeqDeserializer};
use serde::de::{self, IntoDeserializer};
use thiserror::Error;
use tokio::sync::OnceCell;

static ENV_VARS: LazyLock<OnceCell<Env>> = LazyLock::new(OnceCell::new);

pub async fn get() -> EnvResult<&'static Env> {
    Ok(ENV_VARS.get_or_try_init(|| async { Env::new() }).await?)
}

pub async fn get_var(var: Var) -> EnvResult<&'static str> {
    let vars = get().await?;
    Ok(match var {
        Var::TokenSecret => &vars.token_secret,
        Var::ClientKeys => &vars.client_keys,
        Var::InternalToken => &vars.internal_token,
        Var::DatabaseUrl => &vars.database_url,
        Var::RedisUrl => &vars.redis_url,
        Var::CorsAllowOrigins => &vars.cors_allow_origins,
        Var::OtelExporterEndpoint => &vars.otel_exporter_otlp_endpoint,
        Var::ServiceName => &vars.service_name,
    })
}

/// Seeds the process-wide env singleton so tests never depend on a `.env`
/// file or real process variables. First seed wins; later calls are no-ops.
#[cfg(test)]
pub(crate) fn seed_test_env() {
    let _ = ENV_VARS.set(test_env());
}

#[cfg(test)]
pub(crate) fn test_env() -> Env {
    from_iter([
        ("TOKEN_SECRET".to_owned(), "super-secret-signing-key".to_owned()),
        (
            "CLIENT_KEYS".to_owned(),
            "test-client-key,spare-client-key,paging-client-key,burst-limited-key,socket-client-key"
                .to_owned(),
        ),
        ("INTERNAL_TOKEN".to_owned(), "test-internal-token".to_owned()),
    ])
    .expect("test env must deserialize")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Env {
    pub token_secret: String,
    pub client_keys: String,
    pub internal_token: String,

    #[serde(default = "default_bind_port")]
    pub server_bind_port: u16,
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub redis_url: String,
    #[serde(default = "default_backend")]
    pub storage_backend: String,
    #[serde(default = "default_backend")]
    pub replay_backend: String,
    #[serde(default = "default_cors")]
    pub cors_allow_origins: String,
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_token_skew")]
    pub token_skew_secs: u64,
    #[serde(default = "default_replay_retention")]
    pub replay_retention_secs: u64,

    #[serde(default = "default_frequency_limit")]
    pub risk_frequency_limit: u32,
    #[serde(default = "default_weight_frequency")]
    pub risk_weight_frequency: f64,
    #[serde(default = "default_weight_magnitude")]
    pub risk_weight_magnitude: f64,
    #[serde(default = "default_weight_action_mix")]
    pub risk_weight_action_mix: f64,
    #[serde(default = "default_weight_session")]
    pub risk_weight_session: f64,

    #[serde(default = "default_queue_capacity")]
    pub fanout_queue_capacity: u32,
    #[serde(default = "default_top_k")]
    pub fanout_top_k: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub ledger_retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub ledger_retry_base_ms: u64,

    #[serde(default = "default_rate_burst")]
    pub rate_limit_burst: u32,
    #[serde(default = "default_rate_per_sec")]
    pub rate_limit_per_sec: u32,
}

fn default_bind_port() -> u16 {
    8080
}
fn default_backend() -> String {
    "memory".to_owned()
}
fn default_cors() -> String {
    "*".to_owned()
}
fn default_service_name() -> String {
    "podium-server".to_owned()
}
fn default_token_ttl() -> u64 {
    300
}
fn default_token_skew() -> u64 {
    30
}
fn default_replay_retention() -> u64 {
    900
}
fn default_frequency_limit() -> u32 {
    20
}
fn default_weight_frequency() -> f64 {
    0.60
}
fn default_weight_magnitude() -> f64 {
    0.10
}
fn default_weight_action_mix() -> f64 {
    0.20
}
fn default_weight_session() -> f64 {
    0.10
}
fn default_queue_capacity() -> u32 {
    16
}
fn default_top_k() -> u32 {
    25
}
fn default_heartbeat_interval() -> u64 {
    20
}
fn default_heartbeat_timeout() -> u64 {
    60
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    50
}
fn default_rate_burst() -> u32 {
    10
}
fn default_rate_per_sec() -> u32 {
    5
}

impl Env {
    pub fn new() -> EnvResult<Self> {
        let env = from_env::<Env>()?;
        env.validate()?;

        Ok(env)
    }

    /// Rejects configurations that would silently break scoring or replay
    /// protection rather than letting them fail at request time.
    pub fn validate(&self) -> EnvResult<()> {
        if self.client_keys.split(',').all(|k| k.trim().is_empty()) {
            return Err(EnvErr::Invalid("CLIENT_KEYS must contain at least one key".into()));
        }

        let weight_sum = self.risk_weight_frequency
            + self.risk_weight_magnitude
            + self.risk_weight_action_mix
            + self.risk_weight_session;
        if (weight_sum - 1.0).abs() > 1e-9 {
            return Err(EnvErr::Invalid(format!(
                "risk weights must sum to 1.0 (got {weight_sum})"
            )));
        }

        if self.replay_retention_secs < self.token_ttl_secs + self.token_skew_secs {
            return Err(EnvErr::Invalid(format!(
                "REPLAY_RETENTION_SECS ({}) must cover token ttl + skew ({})",
                self.replay_retention_secs,
                self.token_ttl_secs + self.token_skew_secs
            )));
        }

        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(EnvErr::Invalid(
                "HEARTBEAT_TIMEOUT_SECS must exceed HEARTBEAT_INTERVAL_SECS".into(),
            ));
        }

        if !matches!(self.storage_backend.as_str(), "memory" | "postgres") {
            return Err(EnvErr::Invalid(format!(
                "unsupported STORAGE_BACKEND '{}'",
                self.storage_backend
            )));
        }

        if !matches!(self.replay_backend.as_str(), "memory" | "redis") {
            return Err(EnvErr::Invalid(format!(
                "unsupported REPLAY_BACKEND '{}'",
                self.replay_backend
            )));
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum Var {
    TokenSecret,
    ClientKeys,
    InternalToken,
    DatabaseUrl,
    RedisUrl,
    CorsAllowOrigins,
    OtelExporterEndpoint,
    ServiceName,
}

#[macro_export]
macro_rules! var {
    ($ev:expr) => {
        $crate::util::env::get_var($ev)
    };
}

// ---
//  Deserializer implementation
// ---

struct Val(String, String);
struct Varname(String);

struct Deserializer<'de, Iter: Iterator<Item = (String, String)>> {
    inner: MapDeserializer<'de, Vars<Iter>, EnvDeserializeError>,
}

struct Vars<Iter>
where
    Iter: IntoIterator<Item = (String, String)>,
{
    inner: Iter,
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Val {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Varname {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl<Iter: Iterator<Item = (String, String)>> Iterator for Vars<Iter> {
    type Item = (Varname, Val);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(k, v)| (Varname(k.clone()), Val(k, v)))
    }
}

macro_rules! forward_parsed_vals {
    ($($ty:ident => $method:ident,)*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, EnvDeserializeError>
            where
                V: de::Visitor<'de>
            {
                match self.1.parse::<$ty>() {
                    Ok(val) => val.into_deserializer().$method(visitor),
                    Err(e) => Err(serde::de::Error::custom(format_args!(
                        "{}: while parsing '{}' (provider: {})",
                        e, self.1, self.0
                    )))
                }
            }
        )*
    };
}

impl<'de> serde::de::Deserializer<'de> for Val {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.1.into_deserializer().deserialize_any(visitor)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.1.is_empty() {
            SeqDeserializer::new(empty::<Val>()).deserialize_seq(visitor)
        } else {
            let values = self
                .1
                .split(',')
                .map(|v| Val(self.0.clone(), v.trim().to_owned()));
            SeqDeserializer::new(values).deserialize_seq(visitor)
        }
    }

    fn deserialize_newtype_struct<V>(
        self,
        _: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_enum(self.1.into_deserializer())
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_some(self)
    }

    forward_parsed_vals! {
        bool => deserialize_bool,
        u8 => deserialize_u8,
        u16 => deserialize_u16,
        u32 => deserialize_u32,
        u64 => deserialize_u64,
        i8 => deserialize_i8,
        i16 => deserialize_i16,
        i32 => deserialize_i32,
        i64 => deserialize_i64,
        f32 => deserialize_f32,
        f64 => deserialize_f64,
    }

    serde::forward_to_deserialize_any! {
        char str string unit bytes byte_buf map
        unit_struct tuple_struct identifier tuple
        ignored_any
        struct
    }
}

impl<'de> serde::de::Deserializer<'de> for Varname {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.0.into_deserializer().deserialize_any(visitor)
    }

    #[inline]
    fn deserialize_newtype_struct<V>(
        self,
        _: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf map
        unit_struct tuple_struct identifier tuple ignored_any
        bool u8 u16 u32 u64 i8 i16 i32 i64 f32 f64 enum struct
    }
}

impl<'de, Iter: Iterator<Item = (String, String)>> Deserializer<'de, Iter> {
    fn new(vars: Iter) -> Self {
        Deserializer {
            inner: MapDeserializer::new(Vars { inner: vars }),
        }
    }
}

impl<'de, Iter: Iterator<Item = (String, String)>> serde::de::Deserializer<'de>
    for Deserializer<'de, Iter>
{
    type Error = EnvDeserializeError;
    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_map(visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_map(self.inner)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf
        newtype_struct unit_struct tuple_struct identifier
        tuple ignored_any bool u8 u16 u32 u64 i8 i16 i32 i64
        f32 f64 enum struct
    }
}

pub fn from_env<T>() -> Result<T, EnvDeserializeError>
where
    T: serde::de::DeserializeOwned,
{
    let vars = dotenvy::vars();
    from_iter(vars)
}

pub fn from_iter<Iter, T>(iter: Iter) -> Result<T, EnvDeserializeError>
where
    T: serde::de::DeserializeOwned,
    Iter: IntoIterator<Item = (String, String)>,
{
    T::deserialize(Deserializer::new(iter.into_iter()))
}

impl serde::de::Error for EnvDeserializeError {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        EnvDeserializeError::Custom(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        EnvDeserializeError::MissingValue(field.into())
    }
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error(transparent)]
    Dotenvy(#[from] dotenvy::Error),

    #[error(transparent)]
    DeserializationError(#[from] EnvDeserializeError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum EnvDeserializeError {
    #[error("env deserialization error: {0}")]
    Custom(String),

    #[error("{0}")]
    MissingValue(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_vars() -> Vec<(String, String)> {
        vec![
            ("TOKEN_SECRET".to_owned(), "s3kr1t".to_owned()),
            ("CLIENT_KEYS".to_owned(), "alpha,beta".to_owned()),
            ("INTERNAL_TOKEN".to_owned(), "internal".to_owned()),
        ]
    }

    #[test]
    fn defaults_fill_unset_tunables() {
        let env: Env = from_iter(base_vars()).unwrap();

        assert_eq!(env.server_bind_port, 8080);
        assert_eq!(env.token_ttl_secs, 300);
        assert_eq!(env.token_skew_secs, 30);
        assert_eq!(env.risk_frequency_limit, 20);
        assert_eq!(env.fanout_queue_capacity, 16);
        assert_eq!(env.storage_backend, "memory");
        assert!((env.risk_weight_frequency - 0.60).abs() < f64::EPSILON);
        assert!(env.validate().is_ok());
    }

    #[test]
    fn numeric_overrides_parse() {
        let mut vars = base_vars();
        vars.push(("SERVER_BIND_PORT".to_owned(), "9191".to_owned()));
        vars.push(("TOKEN_TTL_SECS".to_owned(), "120".to_owned()));
        vars.push(("RISK_WEIGHT_FREQUENCY".to_owned(), "0.5".to_owned()));
        vars.push(("RISK_WEIGHT_ACTION_MIX".to_owned(), "0.3".to_owned()));

        let env: Env = from_iter(vars).unwrap();
        assert_eq!(env.server_bind_port, 9191);
        assert_eq!(env.token_ttl_secs, 120);
        assert!((env.risk_weight_frequency - 0.5).abs() < f64::EPSILON);
        assert!(env.validate().is_ok());
    }

    #[test]
    fn missing_secret_is_an_error() {
        let res: Result<Env, _> = from_iter(vec![(
            "CLIENT_KEYS".to_owned(),
            "alpha".to_owned(),
        )]);
        assert!(res.is_err());
    }

    #[test]
    fn rejects_weights_that_do_not_sum_to_one() {
        let mut vars = base_vars();
        vars.push(("RISK_WEIGHT_SESSION".to_owned(), "0.5".to_owned()));

        let env: Env = from_iter(vars).unwrap();
        assert!(matches!(env.validate(), Err(EnvErr::Invalid(_))));
    }

    #[test]
    fn rejects_retention_shorter_than_token_lifetime() {
        let mut vars = base_vars();
        vars.push(("REPLAY_RETENTION_SECS".to_owned(), "60".to_owned()));

        let env: Env = from_iter(vars).unwrap();
        assert!(matches!(env.validate(), Err(EnvErr::Invalid(_))));
    }

    #[tokio::test]
    async fn test_vars_macro() {
        seed_test_env();
        let keys = var!(Var::ClientKeys).await.unwrap();
        assert!(keys.contains("test-client-key"));
    }
}
