/// Declares (or reuses) the per-call-site static descriptor and evaluates to
/// its `&'static` reference.
///
/// Two evaluations of the same textual site share one descriptor; two
/// distinct sites never do. That pointer identity is what the program-point
/// tracker keys on.
#[macro_export]
macro_rules! program_point {
    ($name:expr) => {{
        static POINT: $crate::ppoint::ProgramPoint = $crate::ppoint::ProgramPoint {
            name: $name,
            function: ::core::module_path!(),
            file: ::core::file!(),
            line: ::core::line!(),
            unique: ::core::column!(),
        };
        &POINT
    }};
}

/// Builds a [`PointRecord`](crate::ppoint::PointRecord) for this call site,
/// with an optional loop iteration (anything convertible to `u128`).
#[macro_export]
macro_rules! point_record {
    ($name:expr) => {
        $crate::point_record!($name, 0u8)
    };
    ($name:expr, $iter:expr) => {
        $crate::ppoint::PointRecord::new(
            $crate::program_point!($name),
            ::core::convert::Into::<u128>::into($iter),
        )
    };
}

/// Returns the state index for this call site: `imsm_index!(ctx, "name")` or
/// `imsm_index!(ctx, "name", iteration)`.
#[macro_export]
macro_rules! imsm_index {
    ($ctx:expr, $name:expr) => {
        $ctx.index($crate::point_record!($name))
    };
    ($ctx:expr, $name:expr, $iter:expr) => {
        $ctx.index($crate::point_record!($name, $iter))
    };
}

/// Opens a program region for the rest of the enclosing scope. The region
/// pops when the scope exits, on every path.
#[macro_export]
macro_rules! imsm_region {
    ($ctx:expr, $name:expr) => {
        let _imsm_region = $ctx.region_push($crate::point_record!($name));
    };
    ($ctx:expr, $name:expr, $iter:expr) => {
        let _imsm_region = $ctx.region_push($crate::point_record!($name, $iter));
    };
}

/// Bumps one or more operation counters by 1: `stat_inc!(slab_gets)` or
/// `stat_inc!(stage_calls, stage_ins)`. With the `stats` feature off, the
/// whole invocation vanishes, so hot paths stay untouched in default builds.
#[macro_export]
macro_rules! stat_inc {
    ($($counter:ident),+ $(,)?) => {
        #[cfg(feature = "stats")]
        {
            $(
                $crate::stats::STATS
                    .$counter
                    .fetch_add(1, ::core::sync::atomic::Ordering::Relaxed);
            )+
        }
    };
}
