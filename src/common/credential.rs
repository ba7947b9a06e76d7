//! 会话凭据：主/副标识符、共享密钥以及 SHA-224 口令摘要缓存。

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha224, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::config::types::CredentialsConfig;

/// 2007-07-07T00:00:00Z
const ROTATION_EPOCH_SECS: i64 = 1_183_766_400;
/// 轮换周期计算时对当前时间的偏移（+8h）
const ROTATION_CLOCK_SHIFT_SECS: i64 = 8 * 3600;

/// secret -> hex(SHA224(secret))，进程级记忆化，写入幂等
static HASH_CACHE: LazyLock<RwLock<HashMap<String, Arc<str>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// 每个会话只读的凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub primary: String,
    pub secondary: Option<String>,
    pub secret: String,
}

impl Credentials {
    pub fn new(primary: impl Into<String>, secondary: Option<String>, secret: impl Into<String>) -> Self {
        Self {
            primary: primary.into().to_ascii_lowercase(),
            secondary: secondary.map(|s| s.to_ascii_lowercase()),
            secret: secret.into(),
        }
    }

    /// 从配置构造；配置了 key 或 uuid 不是标准 v4 格式时按周期派生标识符
    pub fn from_config(config: &CredentialsConfig, now: SystemTime) -> Self {
        let seed = config
            .key
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&config.uuid);

        if config.key.as_deref().is_some_and(|k| !k.is_empty()) || !is_strict_v4(&config.uuid) {
            let now_secs = now
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default();
            let cycle = rotation_cycle(now_secs, config.rotation_days, config.rotation_hour);
            let primary = derive_identifier(seed, cycle);
            let secondary = derive_identifier(seed, cycle - 1);
            debug!(cycle, "derived rotating identifiers");
            return Self::new(primary, Some(secondary), seed);
        }

        Self::new(config.uuid.clone(), None, config.uuid.clone())
    }

    /// VLESS 使用的标识符列表（主在前）
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids = vec![self.primary.as_str()];
        if let Some(secondary) = &self.secondary {
            ids.push(secondary.as_str());
        }
        ids
    }

    /// 预先计算口令摘要，避免首个会话付出哈希开销
    pub fn warm_up(&self) {
        let _ = password_hash(&self.secret);
    }
}

/// 计算口令的 SHA224 hex 散列（带缓存）
pub fn password_hash(secret: &str) -> Arc<str> {
    if let Ok(cache) = HASH_CACHE.read() {
        if let Some(hit) = cache.get(secret) {
            return hit.clone();
        }
    }
    let digest: Arc<str> = hex_encode(&Sha224::digest(secret.as_bytes())).into();
    if let Ok(mut cache) = HASH_CACHE.write() {
        cache.insert(secret.to_string(), digest.clone());
    }
    digest
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 当前轮换周期序号：ceil((now + 8h - epoch(hour)) / days)
pub fn rotation_cycle(now_secs: i64, days: u32, hour: u32) -> i64 {
    let start = ROTATION_EPOCH_SECS + i64::from(hour.min(23)) * 3600;
    let period = i64::from(days.max(1)) * 86_400;
    let diff = now_secs + ROTATION_CLOCK_SHIFT_SECS - start;
    diff.div_euclid(period) + i64::from(diff.rem_euclid(period) != 0)
}

/// SHA-256(seed ‖ cycle) 格式化成 v4 UUID 形态
pub fn derive_identifier(seed: &str, cycle: i64) -> String {
    let hex = hex_encode(&Sha256::digest(format!("{}{}", seed, cycle).as_bytes()));
    let variant = u8::from_str_radix(&hex[16..18], 16).unwrap_or_default();
    let variant = (variant & 0x3f) | 0x80;
    format!(
        "{}-{}-4{}-{:02x}{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[13..16],
        variant,
        &hex[18..20],
        &hex[20..32]
    )
}

fn is_strict_v4(s: &str) -> bool {
    s.len() == 36
        && Uuid::try_parse(s).is_ok_and(|u| {
            u.get_version_num() == 4 && u.get_variant() == uuid::Variant::RFC4122
        })
}
