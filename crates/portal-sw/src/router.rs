//! Request classification.

use portal_net::{Origin, Request, UrlPattern};
use tracing::debug;
use url::Url;

/// What the worker does with an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not ours: let the default network path handle it, untouched.
    Passthrough,
    /// Data-service call: freshest server state first.
    NetworkFirst,
    /// Static asset: the cache is authoritative until evicted.
    CacheFirst,
}

/// Picks a [`Disposition`] from the request origin and URL.
#[derive(Debug, Clone)]
pub struct Router {
    origin: Origin,
    data_service: Vec<UrlPattern>,
}

impl Router {
    pub fn new(app_url: &Url, data_service: Vec<UrlPattern>) -> Self {
        Self {
            origin: Origin::from_url(app_url),
            data_service,
        }
    }

    /// The application origin.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn classify(&self, request: &Request) -> Disposition {
        let disposition = if !self.origin.contains(&request.url) {
            Disposition::Passthrough
        } else if self.data_service.iter().any(|p| p.matches(&request.url)) {
            Disposition::NetworkFirst
        } else {
            Disposition::CacheFirst
        };

        debug!(url = %request.url, ?disposition, "Classified request");
        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(
            &Url::parse("https://portal.example/").unwrap(),
            vec![UrlPattern::contains("/rest/v1/")],
        )
    }

    fn classify(url: &str) -> Disposition {
        router().classify(&Request::parse(url).unwrap())
    }

    #[test]
    fn test_cross_origin_is_passthrough() {
        assert_eq!(classify("https://fonts.example/inter.woff2"), Disposition::Passthrough);
        // A data-service URL on another origin is still not ours.
        assert_eq!(
            classify("https://abc.supabase.co/rest/v1/students"),
            Disposition::Passthrough
        );
        assert_eq!(classify("http://portal.example/"), Disposition::Passthrough);
    }

    #[test]
    fn test_data_service_is_network_first() {
        assert_eq!(
            classify("https://portal.example/rest/v1/results?student=eq.7"),
            Disposition::NetworkFirst
        );
    }

    #[test]
    fn test_everything_else_is_cache_first() {
        assert_eq!(classify("https://portal.example/"), Disposition::CacheFirst);
        assert_eq!(classify("https://portal.example/static/js/main.js"), Disposition::CacheFirst);
    }
}
