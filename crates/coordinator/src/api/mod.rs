pub mod auth;
pub mod rate_limit;
pub mod rate_limit_middleware;
pub mod routes;
