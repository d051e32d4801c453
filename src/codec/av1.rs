// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod cdf;
pub mod entropy;
pub mod header;
pub(crate) mod helpers;
pub mod partition;
