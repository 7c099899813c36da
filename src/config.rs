//! 레지스트리 설정
//!
//! 기본값, 환경 변수, 또는 serde 역직렬화로 구성한다.

use std::env;

use serde::Deserialize;

use crate::module::DEFAULT_NAMESPACE;

/// 기본 이름공간 환경 변수
pub const ENV_DEFAULT_NAMESPACE: &str = "HOTMOD_DEFAULT_NAMESPACE";
/// 언로드 시 표준 출력 flush 여부 환경 변수
pub const ENV_FLUSH_ON_FREE: &str = "HOTMOD_FLUSH_ON_FREE";

/// 레지스트리 동작 설정
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 빈 이름공간으로 로드할 때 사용하는 이름공간
    pub default_namespace: String,
    /// reload/unload로 유닛을 해제할 때 표준 출력을 먼저 비울지 여부
    pub flush_on_free: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_namespace: String::from(DEFAULT_NAMESPACE),
            flush_on_free: false,
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_namespace(mut self, namespace: &str) -> Self {
        self.default_namespace = namespace.to_owned();
        self
    }

    pub fn with_flush_on_free(mut self, flush: bool) -> Self {
        self.flush_on_free = flush;
        self
    }

    /// 환경 변수로 기본값 덮어쓰기
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(namespace) = lookup(ENV_DEFAULT_NAMESPACE).filter(|v| !v.trim().is_empty()) {
            config.default_namespace = namespace.trim().to_owned();
        }
        if let Some(flush) = lookup(ENV_FLUSH_ON_FREE).as_deref().and_then(parse_bool) {
            config.flush_on_free = flush;
        }
        config
    }

    /// 빈 이름공간을 기본 이름공간으로 치환
    pub fn namespace_or_default<'a>(&'a self, namespace: &'a str) -> &'a str {
        if namespace.is_empty() {
            &self.default_namespace
        } else {
            namespace
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
