// Integration tests: gateway and workers talking through a broker.
// Everything except `live_rabbitmq` runs on the in-memory broker.

mod common;

mod bridge_flow;
mod live_rabbitmq;
mod reliability;
