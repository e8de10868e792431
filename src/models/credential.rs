//! API 密钥与密钥池
//!
//! 一次运行中：一个密钥 ↔ 一个 worker ↔ 一个批次。

use crate::error::CredentialError;
use std::collections::HashSet;
use std::fmt;
use tracing::{error, warn};

/// 不透明的访问密钥
///
/// `Debug` / `Display` 只显示脱敏后的形式，原文只能通过 [`Credential::expose`] 取得。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Result<Self, CredentialError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(CredentialError::Empty);
        }
        Ok(Self(token))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// 脱敏显示：保留前 3 位和后 4 位
    pub fn redacted(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}…{}", head, tail)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.redacted())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// 密钥池：划分为"处理用"和"分析用"两部分
#[derive(Debug, Clone)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    reserved_for_analysis: usize,
}

impl CredentialPool {
    /// 创建密钥池，空白和重复的密钥会被丢弃
    pub fn new(tokens: impl IntoIterator<Item = String>, reserved_for_analysis: usize) -> Self {
        let mut seen = HashSet::new();
        let mut credentials = Vec::new();
        for token in tokens {
            match Credential::new(token) {
                Ok(credential) => {
                    if seen.insert(credential.clone()) {
                        credentials.push(credential);
                    } else {
                        warn!("⚠️ 忽略重复的API密钥: {}", credential);
                    }
                }
                Err(_) => warn!("⚠️ 忽略空白的API密钥"),
            }
        }
        Self {
            credentials,
            reserved_for_analysis,
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// 密钥数超过预留数时，预留最后几个；否则不预留
    fn split_point(&self) -> usize {
        let total = self.credentials.len();
        if total > self.reserved_for_analysis {
            total - self.reserved_for_analysis
        } else {
            total
        }
    }

    /// 用于筛选的密钥
    ///
    /// 返回空列表时调用方不能开始运行。
    pub fn reserve_for_processing(&self) -> Vec<Credential> {
        let processing = self.credentials[..self.split_point()].to_vec();
        if processing.is_empty() {
            error!("❌ {}", CredentialError::NoneForProcessing);
        }
        processing
    }

    /// 留作结果分析的密钥
    pub fn reserve_for_analysis(&self) -> Vec<Credential> {
        let analysis = self.credentials[self.split_point()..].to_vec();
        if analysis.is_empty() && self.reserved_for_analysis > 0 {
            warn!(
                "⚠️ API密钥数量不足（{} 个），没有预留用于结果分析的密钥",
                self.credentials.len()
            );
        }
        analysis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("sk-test-key-{:04}", i)).collect()
    }

    #[test]
    fn test_partition_invariant() {
        for k in 0..8 {
            let pool = CredentialPool::new(keys(k), 2);
            let processing = pool.reserve_for_processing();
            let analysis = pool.reserve_for_analysis();
            if k >= 3 {
                assert_eq!(processing.len(), k - 2);
                assert_eq!(analysis.len(), 2);
                assert_eq!(processing.len() + analysis.len(), k);
            } else {
                assert_eq!(processing.len(), k);
                assert!(analysis.is_empty());
            }
            assert!(processing.iter().all(|c| !analysis.contains(c)));
        }
    }

    #[test]
    fn test_analysis_takes_last_keys() {
        let pool = CredentialPool::new(keys(4), 2);
        let analysis = pool.reserve_for_analysis();
        assert_eq!(analysis[0].expose(), "sk-test-key-0002");
        assert_eq!(analysis[1].expose(), "sk-test-key-0003");
    }

    #[test]
    fn test_duplicates_and_blanks_dropped() {
        let tokens = vec![
            "sk-aaaaaaaaaa".to_string(),
            "  ".to_string(),
            "sk-aaaaaaaaaa".to_string(),
            "sk-bbbbbbbbbb".to_string(),
        ];
        let pool = CredentialPool::new(tokens, 0);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.reserve_for_processing().len(), 2);
    }

    #[test]
    fn test_display_is_redacted() {
        let credential = Credential::new("sk-1234567890abcdef").unwrap();
        assert_eq!(credential.to_string(), "sk-…cdef");
        assert!(!format!("{:?}", credential).contains("1234567890"));
    }
}
