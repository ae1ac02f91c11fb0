// SPDX-License-Identifier: MPL-2.0

pub mod handlers;
pub mod media;
pub mod server;
pub mod session;
