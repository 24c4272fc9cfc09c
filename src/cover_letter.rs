/// Fills the pitch template for a job. Output depends only on the inputs so
/// the text a human approves is exactly the text that gets submitted.
pub fn compose(job_title: &str, video_link: Option<&str>) -> String {
    let video_line = match video_link.map(str::trim).filter(|link| !link.is_empty()) {
        Some(link) => format!("\nI've recorded a short video specifically for this role: {}\n", link),
        None => String::new(),
    };

    format!(
        "Hi,\n{}\nI believe my experience is a strong match for \"{}\". \
         I'd welcome the chance to discuss how I can help you achieve your goals.\n\nBest regards",
        video_line, job_title
    )
}
