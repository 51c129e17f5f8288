//! The standard services of a field device.
//!
//! | id | service | depends on |
//! |----|---------|------------|
//! | `SC_CONFIG_SERVICE` | [`ConfigService`] | |
//! | `SC_DATA_SERVICE` | [`DataService`] | |
//! | `SC_SENSOR_SERVICE` | [`SensorService`] | |
//! | `SC_AUTH_SERVICE` | [`AuthService`] | config |
//! | `SC_BACKEND_SERVICE` | [`BackendService`] | auth, config, data, sensor |

mod auth;
mod backend;
mod config;
mod data;
mod sensor;

pub use auth::AuthService;
pub use backend::{BackendService, CONFIG_REQUEST_TOPIC};
pub use config::{ConfigService, RemoteSettings};
pub use data::DataService;
pub use sensor::{SensorReading, SensorService, OBSERVATION_LAYER, SENSOR_STORE};
