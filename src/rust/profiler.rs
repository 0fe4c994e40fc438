// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wall-clock timing of migration phases, compiled in with the `profiler` feature.

//==============================================================================
// Macros
//==============================================================================

/// Times the rest of the enclosing block under `$name`.
#[macro_export]
macro_rules! lb_profile {
    ($name:expr) => {
        #[cfg(feature = "profiler")]
        let __lb_profiler_dropped_object__ = $crate::profiler::DroppedObject::begin($name);
    };
}

#[cfg(feature = "profiler")]
pub use self::imp::*;

//==============================================================================
// Structures
//==============================================================================

#[cfg(feature = "profiler")]
mod imp {
    use ::std::{
        io,
        sync::Mutex,
        time::{
            Duration,
            Instant,
        },
    };

    lazy_static! {
        static ref DATA: Mutex<Vec<(&'static str, Duration)>> = Mutex::new(Vec::new());
    }

    pub struct DroppedObject {
        name: &'static str,
        begin: Instant,
    }

    impl DroppedObject {
        pub fn begin(name: &'static str) -> Self {
            Self {
                name,
                begin: Instant::now(),
            }
        }
    }

    impl Drop for DroppedObject {
        fn drop(&mut self) {
            let elapsed: Duration = self.begin.elapsed();
            match DATA.lock() {
                Ok(mut data) => data.push((self.name, elapsed)),
                Err(poisoned) => poisoned.into_inner().push((self.name, elapsed)),
            }
        }
    }

    /// Drains the recorded intervals into `w`, one `name: nanoseconds` line each.
    pub fn write_profiler_data<W: io::Write>(w: &mut W) -> io::Result<()> {
        let data: Vec<(&'static str, Duration)> = match DATA.lock() {
            Ok(mut data) => data.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for (name, datum) in data {
            writeln!(w, "{}: {} ns", name, datum.as_nanos())?;
        }
        Ok(())
    }

}
