pub mod ping_routes;
