pub mod edge_degrees;
