pub mod nat64;

use std::sync::Arc;

pub use nat64::{AddressTranslator, DohTranslator, Nat64Prefix, TranslationCache};

use crate::common::ProxyError;
use crate::config::TranslationConfig;

/// 按配置构造地址转换器；DoH 端点和前缀都没配置时返回 `None`
pub fn build_translator(config: &TranslationConfig) -> Result<Option<Arc<dyn AddressTranslator>>, ProxyError> {
    let endpoint = config.doh.clone().filter(|s| !s.trim().is_empty());
    let prefix = config.prefix.as_deref().filter(|s| !s.trim().is_empty());
    if endpoint.is_none() && prefix.is_none() {
        return Ok(None);
    }
    let prefix = match prefix {
        Some(p) => p.parse()?,
        None => Nat64Prefix::default(),
    };
    Ok(Some(Arc::new(DohTranslator::new(endpoint, prefix)?)))
}
