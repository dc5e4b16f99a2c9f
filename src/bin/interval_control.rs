// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use interval_control::interval_control::interval_main;

fn main() {
    interval_main();
}
