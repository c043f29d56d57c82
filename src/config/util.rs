//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

pub fn default_limit_rows() -> usize {
    100
}

pub fn default_lock_ttl() -> u64 {
    60
}

pub fn default_cache_ttl() -> u64 {
    3600
}

pub fn default_volume_retry_delay() -> u64 {
    1
}

pub fn default_resource_checking_interval() -> u64 {
    60
}

pub fn default_resource_type_checking_interval() -> u64 {
    60
}

pub fn default_build_tracking_interval() -> u64 {
    10
}
