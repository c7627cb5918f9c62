use crate::models::{AcademicProfile, StudentRecord};

pub fn profile_of(student: &StudentRecord, through_term: u32) -> AcademicProfile {
    student
        .term_results()
        .iter()
        .filter(|result| result.term <= through_term)
        .map(|result| (result.term, result.cumulative_average))
        .collect()
}

/// A candidate missing any profiled term is rejected.
pub fn select_similar<'a>(
    pool: &'a [StudentRecord],
    profile: &AcademicProfile,
    tolerance: f64,
) -> Vec<&'a StudentRecord> {
    pool.iter()
        .filter(|candidate| is_similar(candidate, profile, tolerance))
        .collect()
}

fn is_similar(candidate: &StudentRecord, profile: &AcademicProfile, tolerance: f64) -> bool {
    profile.iter().all(|(term, expected)| {
        candidate
            .result_at(*term)
            .is_some_and(|result| (result.cumulative_average - expected).abs() <= tolerance)
    })
}
