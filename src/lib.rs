// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod driver;
pub mod errors;
pub mod info;
pub mod insights;
pub mod plugin;
pub mod store;
pub mod stream;
