// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec components shipped with the harness.
//!
//! A backend is a provider of decoding or encoding implementing [`crate::codec::Codec`]. Platform
//! components are reached through their own bindings; the components in this module run
//! in-process and are used to exercise the harness itself.

pub mod loopback;
