// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod clock;
pub mod fail;
pub mod logging;

//==============================================================================
// Exports
//==============================================================================

pub use self::{
    clock::{
        Clock,
        ManualClock,
        SystemClock,
    },
    fail::Fail,
};
