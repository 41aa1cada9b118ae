//! Shard routing over request-id bit suffixes.
//!
//! Each shard id encodes an implicit bit suffix: with `b` the position of
//! the id's highest set bit, the low `b` bits are the suffix and a request
//! id belongs to the shard iff its lowest `b` bits match. `id = 1` has an
//! empty suffix and catches everything. A configuration is valid only when
//! the resulting binary trie partitions the whole 256-bit request-id space
//! exhaustively and without overlap.

use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::ShardConfig;

/// Request ids are 256-bit values; traversal never legitimately goes deeper.
const MAX_ROUTE_DEPTH: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShardConfigError {
    #[error("shard configuration has no shards")]
    Empty,
    #[error("shard id 0 has no suffix encoding")]
    ZeroId,
    #[error("duplicate shard id {0}")]
    DuplicateId(u32),
    #[error("shard id {0} overlaps another shard's suffix")]
    Overlap(u32),
    #[error("shard suffixes do not cover the full request-id space")]
    Incomplete,
    #[error("shard {id} has invalid url: {reason}")]
    InvalidUrl { id: u32, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Cannot specify both requestId and shardId")]
    BothIdentifiers,
    #[error("JSON-RPC requests must include either requestId or shardId")]
    MissingIdentifier,
    #[error("Invalid requestId: not a hex value")]
    MalformedRequestId,
    #[error("Invalid shardId")]
    MalformedShardId,
    #[error("Unknown shard id {0}")]
    UnknownShard(u32),
    #[error("request id traversal exceeded 256 bits")]
    DepthExceeded,
    #[error("no valid shard configuration installed")]
    Unavailable,
}

/// Decompose a shard id into its routing suffix: `(length, bits)` where
/// `bits` holds the low `length` bits of the id. `1` yields the empty
/// (catch-all) suffix; `0` has no highest set bit and is rejected.
pub fn suffix_bits(id: u32) -> Result<(u32, u32), ShardConfigError> {
    if id == 0 {
        return Err(ShardConfigError::ZeroId);
    }
    let len = 31 - id.leading_zeros();
    let bits = id & !(1u32 << len);
    Ok((len, bits))
}

#[derive(Debug)]
enum TrieNode {
    Leaf(Arc<str>),
    Branch {
        zero: Option<Box<TrieNode>>,
        one: Option<Box<TrieNode>>,
    },
}

impl TrieNode {
    fn empty_branch() -> Self {
        TrieNode::Branch {
            zero: None,
            one: None,
        }
    }
}

/// Immutable routing table built from one shard configuration document.
/// Swapped wholesale by the config reloader; never mutated in place.
#[derive(Debug)]
pub struct ShardRouter {
    trie: Option<TrieNode>,
    by_id: HashMap<u32, Arc<str>>,
    /// Distinct target urls, in first-seen order
    urls: Vec<Arc<str>>,
    version: i64,
}

impl ShardRouter {
    /// Build and validate a router. Fails on duplicate or overlapping ids,
    /// invalid urls, and suffix sets that do not partition the space.
    pub fn build(config: &ShardConfig) -> Result<Self, ShardConfigError> {
        if config.shards.is_empty() {
            return Err(ShardConfigError::Empty);
        }

        let mut by_id: HashMap<u32, Arc<str>> = HashMap::new();
        let mut urls: Vec<Arc<str>> = Vec::new();
        let mut root = TrieNode::empty_branch();

        for shard in &config.shards {
            validate_url(shard.id, &shard.url)?;

            let url: Arc<str> = match urls.iter().find(|u| ***u == *shard.url) {
                Some(existing) => existing.clone(),
                None => {
                    let url: Arc<str> = Arc::from(shard.url.as_str());
                    urls.push(url.clone());
                    url
                }
            };

            if by_id.insert(shard.id, url.clone()).is_some() {
                return Err(ShardConfigError::DuplicateId(shard.id));
            }

            let (len, bits) = suffix_bits(shard.id)?;
            insert_suffix(&mut root, shard.id, len, bits, url)?;
        }

        validate_complete(&root)?;

        Ok(Self {
            trie: Some(root),
            by_id,
            urls,
            version: config.version,
        })
    }

    /// Router installed when no valid configuration exists. Refuses every
    /// routing request; reserved-path traffic is unaffected.
    pub fn failsafe() -> Self {
        Self {
            trie: None,
            by_id: HashMap::new(),
            urls: Vec::new(),
            version: -1,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_failsafe(&self) -> bool {
        self.trie.is_none()
    }

    pub fn target_urls(&self) -> impl Iterator<Item = &str> {
        self.urls.iter().map(|u| u.as_ref())
    }

    /// Walk the trie along the request id's bits, LSB first.
    pub fn route_by_request_id(&self, request_id_hex: &str) -> Result<&str, RouteError> {
        let root = self.trie.as_ref().ok_or(RouteError::Unavailable)?;
        let bits = RequestIdBits::parse(request_id_hex)?;

        let mut node = root;
        let mut depth = 0usize;
        loop {
            match node {
                TrieNode::Leaf(url) => return Ok(url),
                TrieNode::Branch { zero, one } => {
                    if depth >= MAX_ROUTE_DEPTH {
                        return Err(RouteError::DepthExceeded);
                    }
                    let child = if bits.bit(depth) { one } else { zero };
                    // A validated trie always has both children.
                    node = child.as_deref().ok_or(RouteError::Unavailable)?;
                    depth += 1;
                }
            }
        }
    }

    pub fn route_by_shard_id(&self, shard_id: u32) -> Result<&str, RouteError> {
        if self.trie.is_none() {
            return Err(RouteError::Unavailable);
        }
        self.by_id
            .get(&shard_id)
            .map(|u| u.as_ref())
            .ok_or(RouteError::UnknownShard(shard_id))
    }

    /// Uniform pick over the distinct target urls.
    pub fn random_target(&self) -> Result<&str, RouteError> {
        if self.trie.is_none() {
            return Err(RouteError::Unavailable);
        }
        self.urls
            .choose(&mut rand::thread_rng())
            .map(|u| u.as_ref())
            .ok_or(RouteError::Unavailable)
    }

    /// Shared route resolution for the pipeline and the payment engine.
    pub fn resolve(
        &self,
        request_id: Option<&str>,
        shard_id: Option<&str>,
        is_json_rpc: bool,
    ) -> Result<&str, RouteError> {
        match (request_id, shard_id) {
            (Some(_), Some(_)) => Err(RouteError::BothIdentifiers),
            (None, Some(shard)) => {
                let id: u32 = shard
                    .trim()
                    .parse()
                    .map_err(|_| RouteError::MalformedShardId)?;
                self.route_by_shard_id(id)
            }
            (Some(request_id), None) => self.route_by_request_id(request_id),
            (None, None) if is_json_rpc => Err(RouteError::MissingIdentifier),
            (None, None) => self.random_target(),
        }
    }
}

fn validate_url(id: u32, url: &str) -> Result<(), ShardConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ShardConfigError::InvalidUrl {
        id,
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ShardConfigError::InvalidUrl {
            id,
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(ShardConfigError::InvalidUrl {
            id,
            reason: "query and fragment are not allowed".to_string(),
        });
    }
    Ok(())
}

fn insert_suffix(
    root: &mut TrieNode,
    id: u32,
    len: u32,
    bits: u32,
    url: Arc<str>,
) -> Result<(), ShardConfigError> {
    let mut node = root;
    for i in 0..len {
        let branch = match node {
            TrieNode::Branch { zero, one } => {
                if (bits >> i) & 1 == 1 {
                    one
                } else {
                    zero
                }
            }
            // A shorter suffix already terminates here
            TrieNode::Leaf(_) => return Err(ShardConfigError::Overlap(id)),
        };
        node = branch
            .get_or_insert_with(|| Box::new(TrieNode::empty_branch()))
            .as_mut();
    }

    match node {
        TrieNode::Branch {
            zero: None,
            one: None,
        } => {
            *node = TrieNode::Leaf(url);
            Ok(())
        }
        // Either a longer suffix passes through here or an equal one landed
        _ => Err(ShardConfigError::Overlap(id)),
    }
}

/// Every branch must have both children and every path must end in a leaf,
/// otherwise some request ids would have no (or no unique) target.
fn validate_complete(node: &TrieNode) -> Result<(), ShardConfigError> {
    match node {
        TrieNode::Leaf(_) => Ok(()),
        TrieNode::Branch {
            zero: Some(zero),
            one: Some(one),
        } => {
            validate_complete(zero)?;
            validate_complete(one)
        }
        TrieNode::Branch { .. } => Err(ShardConfigError::Incomplete),
    }
}

/// Big-endian bytes of a hex request id, indexable by bit from the LSB end.
struct RequestIdBits {
    bytes: Vec<u8>,
}

impl RequestIdBits {
    fn parse(hex_str: &str) -> Result<Self, RouteError> {
        let trimmed = hex_str.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.is_empty() || digits.len() > 64 {
            return Err(RouteError::MalformedRequestId);
        }

        // hex::decode needs an even digit count; a leading zero changes
        // nothing numerically.
        let padded;
        let digits = if digits.len() % 2 == 1 {
            padded = format!("0{}", digits);
            &padded
        } else {
            digits
        };

        let bytes = hex::decode(digits).map_err(|_| RouteError::MalformedRequestId)?;
        Ok(Self { bytes })
    }

    fn bit(&self, index: usize) -> bool {
        let byte_index = index / 8;
        if byte_index >= self.bytes.len() {
            return false;
        }
        let byte = self.bytes[self.bytes.len() - 1 - byte_index];
        (byte >> (index % 8)) & 1 == 1
    }
}

/// Hot-swappable router slot shared by the pipeline, the payment engine and
/// the config reloader. Readers capture one `Arc` at entry and keep using it
/// for the whole request.
#[derive(Clone)]
pub struct RouterHandle {
    inner: Arc<RwLock<Arc<ShardRouter>>>,
}

impl RouterHandle {
    pub fn new(router: ShardRouter) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(router))),
        }
    }

    pub async fn load(&self) -> Arc<ShardRouter> {
        self.inner.read().await.clone()
    }

    pub async fn store(&self, router: ShardRouter) {
        *self.inner.write().await = Arc::new(router);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ShardInfo;

    fn config(shards: &[(u32, &str)]) -> ShardConfig {
        ShardConfig {
            version: 1,
            shards: shards
                .iter()
                .map(|(id, url)| ShardInfo {
                    id: *id,
                    url: url.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn suffix_bits_encoding() {
        assert_eq!(suffix_bits(1), Ok((0, 0)));
        assert_eq!(suffix_bits(2), Ok((1, 0)));
        assert_eq!(suffix_bits(3), Ok((1, 1)));
        assert_eq!(suffix_bits(4), Ok((2, 0)));
        assert_eq!(suffix_bits(5), Ok((2, 1)));
        assert_eq!(suffix_bits(6), Ok((2, 2)));
        assert_eq!(suffix_bits(7), Ok((2, 3)));
        assert_eq!(suffix_bits(0), Err(ShardConfigError::ZeroId));
    }

    #[test]
    fn catch_all_routes_everything() {
        let router = ShardRouter::build(&config(&[(1, "http://backend:3000")])).unwrap();
        assert_eq!(
            router.route_by_request_id("deadbeef").unwrap(),
            "http://backend:3000"
        );
        assert_eq!(router.route_by_request_id("0").unwrap(), "http://backend:3000");
    }

    #[test]
    fn one_bit_split_routes_by_parity() {
        let router =
            ShardRouter::build(&config(&[(2, "http://a:3000"), (3, "http://b:3000")]))
                .unwrap();

        // ...0 → shard 2, ...1 → shard 3
        assert_eq!(router.route_by_request_id("10").unwrap(), "http://a:3000");
        assert_eq!(router.route_by_request_id("0001").unwrap(), "http://b:3000");
    }

    #[test]
    fn two_bit_complete_config_accepted() {
        let router = ShardRouter::build(&config(&[
            (4, "http://a:3000"),
            (5, "http://b:3000"),
            (6, "http://c:3000"),
            (7, "http://d:3000"),
        ]))
        .unwrap();

        // Suffix 00 → 4, 01 → 5, 10 → 6, 11 → 7
        assert_eq!(router.route_by_request_id("4").unwrap(), "http://a:3000");
        assert_eq!(router.route_by_request_id("5").unwrap(), "http://b:3000");
        assert_eq!(router.route_by_request_id("6").unwrap(), "http://c:3000");
        assert_eq!(router.route_by_request_id("7").unwrap(), "http://d:3000");
    }

    #[test]
    fn half_space_config_rejected() {
        assert_eq!(
            ShardRouter::build(&config(&[(2, "http://a:3000")])).unwrap_err(),
            ShardConfigError::Incomplete
        );
    }

    #[test]
    fn duplicate_id_rejected() {
        assert_eq!(
            ShardRouter::build(&config(&[(2, "http://a:3000"), (2, "http://b:3000")]))
                .unwrap_err(),
            ShardConfigError::DuplicateId(2)
        );
    }

    #[test]
    fn overlapping_suffixes_rejected() {
        // id 1 catches everything, id 2 would be unreachable
        assert_eq!(
            ShardRouter::build(&config(&[(1, "http://a:3000"), (2, "http://b:3000")]))
                .unwrap_err(),
            ShardConfigError::Overlap(2)
        );
        // id 2 (suffix 0) contains id 4 (suffix 00)
        assert_eq!(
            ShardRouter::build(&config(&[
                (2, "http://a:3000"),
                (3, "http://b:3000"),
                (4, "http://c:3000")
            ]))
            .unwrap_err(),
            ShardConfigError::Overlap(4)
        );
    }

    #[test]
    fn invalid_urls_rejected() {
        assert!(matches!(
            ShardRouter::build(&config(&[(1, "ftp://a:3000")])),
            Err(ShardConfigError::InvalidUrl { id: 1, .. })
        ));
        assert!(matches!(
            ShardRouter::build(&config(&[(1, "http://a:3000/?x=1")])),
            Err(ShardConfigError::InvalidUrl { id: 1, .. })
        ));
    }

    #[test]
    fn request_id_parsing_is_prefix_and_case_insensitive() {
        let router =
            ShardRouter::build(&config(&[(2, "http://a:3000"), (3, "http://b:3000")]))
                .unwrap();

        let plain = router.route_by_request_id("00ab").unwrap();
        assert_eq!(router.route_by_request_id("0x00AB").unwrap(), plain);
        assert_eq!(router.route_by_request_id("0X00ab").unwrap(), plain);
    }

    #[test]
    fn malformed_request_ids_rejected() {
        let router = ShardRouter::build(&config(&[(1, "http://a:3000")])).unwrap();
        assert_eq!(
            router.route_by_request_id("zz"),
            Err(RouteError::MalformedRequestId)
        );
        assert_eq!(
            router.route_by_request_id(""),
            Err(RouteError::MalformedRequestId)
        );
        // More than 256 bits
        let long = "f".repeat(65);
        assert_eq!(
            router.route_by_request_id(&long),
            Err(RouteError::MalformedRequestId)
        );
    }

    #[test]
    fn shard_id_lookup() {
        let router =
            ShardRouter::build(&config(&[(2, "http://a:3000"), (3, "http://b:3000")]))
                .unwrap();
        assert_eq!(router.route_by_shard_id(2).unwrap(), "http://a:3000");
        assert_eq!(
            router.route_by_shard_id(9),
            Err(RouteError::UnknownShard(9))
        );
    }

    #[test]
    fn resolve_precedence() {
        let router =
            ShardRouter::build(&config(&[(2, "http://a:3000"), (3, "http://b:3000")]))
                .unwrap();

        assert_eq!(
            router.resolve(Some("abc"), Some("2"), true),
            Err(RouteError::BothIdentifiers)
        );
        assert_eq!(
            router.resolve(None, Some("3"), true).unwrap(),
            "http://b:3000"
        );
        assert_eq!(
            router.resolve(Some("0001"), None, true).unwrap(),
            "http://b:3000"
        );
        assert_eq!(
            router.resolve(None, None, true),
            Err(RouteError::MissingIdentifier)
        );
        // Non-JSON-RPC with no identifiers falls back to a random target
        let url = router.resolve(None, None, false).unwrap();
        assert!(url == "http://a:3000" || url == "http://b:3000");
    }

    #[test]
    fn random_target_picks_distinct_urls_only() {
        let router = ShardRouter::build(&config(&[
            (2, "http://same:3000"),
            (3, "http://same:3000"),
        ]))
        .unwrap();
        assert_eq!(router.target_urls().count(), 1);
        assert_eq!(router.random_target().unwrap(), "http://same:3000");
    }

    #[test]
    fn failsafe_refuses_routing() {
        let router = ShardRouter::failsafe();
        assert_eq!(
            router.route_by_request_id("01"),
            Err(RouteError::Unavailable)
        );
        assert_eq!(router.route_by_shard_id(1), Err(RouteError::Unavailable));
        assert_eq!(router.random_target(), Err(RouteError::Unavailable));
    }

    #[tokio::test]
    async fn handle_swaps_atomically() {
        let handle = RouterHandle::new(ShardRouter::failsafe());
        let before = handle.load().await;
        assert!(before.is_failsafe());

        handle
            .store(ShardRouter::build(&config(&[(1, "http://a:3000")])).unwrap())
            .await;

        // The old reference still answers as it did at capture time.
        assert!(before.is_failsafe());
        assert!(!handle.load().await.is_failsafe());
    }
}
