//! Fetch strategies.
//!
//! Both strategies recover from transport failures locally. Cache I/O errors
//! are logged and treated as a miss (reads) or skipped (writes); they never
//! keep a network response from the caller.

use std::time::Duration;

use http::StatusCode;
use portal_common::with_timeout;
use portal_net::{Fetch, NetError, Request, Response};
use tracing::{debug, trace, warn};

use crate::cache::{Cache, CacheKey, CachedResponse};
use crate::fallback::offline_response;

/// Where a response handed back to the caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
}

/// Result of handling one intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The worker did not intercept; the caller performs the request itself.
    Passthrough,
    /// The worker produced a response.
    Responded {
        response: Response,
        source: ResponseSource,
    },
    /// Network-first double failure: no network and nothing cached.
    Unavailable,
}

impl FetchOutcome {
    /// The response, if one was produced.
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Responded { response, .. } => Some(response),
            _ => None,
        }
    }

    /// The response source, if one was produced.
    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            FetchOutcome::Responded { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// Consume the outcome and return the response, if any.
    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::Responded { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// Everything a strategy needs for one request.
pub struct StrategyContext<'a> {
    pub cache: &'a Cache,
    pub fetcher: &'a dyn Fetch,
    pub network_timeout: Duration,
    pub key_headers: &'a [String],
}

/// The two caching disciplines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    NetworkFirst,
    CacheFirst,
}

impl Strategy {
    pub async fn execute(self, ctx: &StrategyContext<'_>, request: Request) -> FetchOutcome {
        match self {
            Strategy::NetworkFirst => network_first(ctx, request).await,
            Strategy::CacheFirst => cache_first(ctx, request).await,
        }
    }
}

/// Network, then cache. Returns [`FetchOutcome::Unavailable`] when both fail.
pub async fn network_first(ctx: &StrategyContext<'_>, request: Request) -> FetchOutcome {
    let key = CacheKey::for_request(&request, ctx.key_headers);

    match fetch_network(ctx, request).await {
        Ok(response) => {
            store(ctx.cache, &key, &response).await;
            FetchOutcome::Responded {
                response,
                source: ResponseSource::Network,
            }
        }
        Err(e) => {
            debug!(key = %key, error = %e, "Network failed, trying cache");
            match lookup(ctx.cache, &key).await {
                Some(response) => FetchOutcome::Responded {
                    response,
                    source: ResponseSource::Cache,
                },
                None => {
                    warn!(key = %key, "No network and no cached copy");
                    FetchOutcome::Unavailable
                }
            }
        }
    }
}

/// Cache, then network (filling the cache), then the offline fallback.
pub async fn cache_first(ctx: &StrategyContext<'_>, request: Request) -> FetchOutcome {
    let key = CacheKey::for_request(&request, ctx.key_headers);

    if let Some(response) = lookup(ctx.cache, &key).await {
        return FetchOutcome::Responded {
            response,
            source: ResponseSource::Cache,
        };
    }

    let url = request.url.clone();
    match fetch_network(ctx, request).await {
        Ok(response) => {
            store(ctx.cache, &key, &response).await;
            FetchOutcome::Responded {
                response,
                source: ResponseSource::Network,
            }
        }
        Err(e) => {
            debug!(key = %key, error = %e, "Network failed on cache miss, serving offline fallback");
            FetchOutcome::Responded {
                response: offline_response(&url),
                source: ResponseSource::OfflineFallback,
            }
        }
    }
}

/// Network call bounded by the worker's deadline; a timeout is a transport
/// failure like any other.
async fn fetch_network(ctx: &StrategyContext<'_>, request: Request) -> Result<Response, NetError> {
    with_timeout(ctx.network_timeout, ctx.fetcher.fetch(request))
        .await
        .map_err(NetError::from)?
}

/// Exact key first; a keyed miss falls back to the plain method+URL entry
/// written at install time.
async fn lookup(cache: &Cache, key: &CacheKey) -> Option<Response> {
    let entry = match read(cache, key).await {
        Some(entry) => entry,
        None if !key.vary.is_empty() => read(cache, &key.without_vary()).await?,
        None => return None,
    };

    match entry.into_response() {
        Ok(response) => Some(response),
        Err(e) => {
            warn!(cache = %cache.name(), key = %key, error = %e, "Discarding unreadable cache entry");
            None
        }
    }
}

async fn read(cache: &Cache, key: &CacheKey) -> Option<CachedResponse> {
    match cache.match_key(key).await {
        Ok(entry) => entry,
        Err(e) => {
            warn!(cache = %cache.name(), key = %key, error = %e, "Cache read failed");
            None
        }
    }
}

/// Store a duplicate of `response` if it is a 200; anything else is left alone.
async fn store(cache: &Cache, key: &CacheKey, response: &Response) {
    if response.status != StatusCode::OK {
        trace!(key = %key, status = %response.status, "Not caching non-200 response");
        return;
    }

    let entry = CachedResponse::capture(response.duplicate());
    if let Err(e) = cache.put(key, entry).await {
        warn!(cache = %cache.name(), key = %key, error = %e, "Cache write failed");
    }
}
