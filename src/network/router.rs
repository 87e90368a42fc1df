//! # Routers
//!
//! Configuration mode and client mode route requests differently: the
//! captive portal answers everything it does not explicitly handle with the
//! UI page, while the client-mode status server answers unknown paths with
//! 404. Each mode gets its own router rather than one router with
//! mode-dependent branches.

use crate::network::http::HttpRequest;

/// Paths operating systems fetch to detect a captive portal.
pub const CAPTIVE_PROBE_PATHS: &[&str] = &[
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/library/test/success.html",
    "/ncsi.txt",
    "/connecttest.txt",
    "/redirect",
    "/fwlink",
    "/canonical.html",
    "/success.txt",
];

/// What a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The configuration UI
    Portal,
    /// An OS captive-portal check; answered with the UI
    Probe,
    /// Nearby network list
    Scan,
    /// Configuration submission
    Save,
    /// Live measurement JSON
    Data,
    /// Client-mode status page
    StatusPage,
    NotFound,
}

/// Maps requests to routes.
pub trait Router {
    fn route(&self, request: &HttpRequest) -> Route;
}

/// Configuration-mode router: explicit endpoints, everything else is the UI.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptiveRouter;

impl Router for CaptiveRouter {
    fn route(&self, request: &HttpRequest) -> Route {
        let path = request.path.as_str();
        match path {
            "/scan" if request.is_get() => Route::Scan,
            "/save" if request.is_post() => Route::Save,
            "/data" if request.is_get() => Route::Data,
            _ if CAPTIVE_PROBE_PATHS.contains(&path) => Route::Probe,
            _ => Route::Portal,
        }
    }
}

/// Client-mode router: explicit endpoints, everything else is 404.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientRouter;

impl Router for ClientRouter {
    fn route(&self, request: &HttpRequest) -> Route {
        if !request.is_get() {
            return Route::NotFound;
        }
        match request.path.as_str() {
            "/" => Route::StatusPage,
            "/data" => Route::Data,
            _ => Route::NotFound,
        }
    }
}
