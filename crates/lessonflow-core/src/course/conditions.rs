// Copyright (C) 2025 The lessonflow developers
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Path conditions for learner-centric branches.
//!
//! Conditions are evaluated against a [`LearnerHistory`] snapshot: the
//! survey responses collected during this session and the score records the
//! LMS returned for the lessons published so far.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Assessment level of a task or concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssessmentLevel {
    /// Not yet assessed.
    Unknown,
    /// Below expectation.
    BelowExpectation,
    /// At expectation.
    AtExpectation,
    /// Above expectation.
    AboveExpectation,
}

/// The learner's answer to one survey question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResponse {
    /// Question identifier.
    pub question_id: String,
    /// Selected choices, for choice questions.
    #[serde(default)]
    pub selected: Vec<String>,
    /// Free-text answer, for text questions.
    #[serde(default)]
    pub text: Option<String>,
}

/// A completed survey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyResponse {
    /// Key of the survey that was answered.
    pub survey_key: String,
    /// When the learner submitted it.
    pub completed_at: DateTime<Utc>,
    /// Answers.
    #[serde(default)]
    pub responses: Vec<QuestionResponse>,
}

/// A graded task or concept inside a score record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreNode {
    /// Task or concept name.
    pub name: String,
    /// Level reached.
    pub level: AssessmentLevel,
}

/// A score record stored by the LMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    /// LMS record identifier.
    pub record_id: String,
    /// Graded nodes.
    #[serde(default)]
    pub nodes: Vec<ScoreNode>,
}

/// Expected answer of a survey condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedAnswer {
    /// Exactly this set of choices must be selected.
    Choices(Vec<String>),
    /// This text must have been entered.
    Text(String),
}

/// One condition attached to a branch path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathCondition {
    /// Satisfied by the latest response to a survey.
    SurveyResponse {
        /// Survey to look at.
        survey_key: String,
        /// Question to look at.
        question_id: String,
        /// Expected answer.
        expected: ExpectedAnswer,
    },
    /// Satisfied when a task or concept reached a level in any published score.
    AssessmentLevel {
        /// Task or concept name.
        node_name: String,
        /// Required level.
        level: AssessmentLevel,
    },
}

impl PathCondition {
    /// Whether evaluating this condition needs LMS score records.
    pub fn needs_scores(&self) -> bool {
        matches!(self, PathCondition::AssessmentLevel { .. })
    }
}

/// Everything learner-centric conditions may look at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearnerHistory {
    /// Survey responses in collection order.
    pub survey_responses: Vec<SurveyResponse>,
    /// Score records fetched from the LMS.
    pub score_records: Vec<ScoreRecord>,
}

impl LearnerHistory {
    /// Latest response to `survey_key`.
    pub fn latest_response(&self, survey_key: &str) -> Option<&SurveyResponse> {
        self.survey_responses
            .iter()
            .filter(|r| r.survey_key == survey_key)
            .max_by_key(|r| r.completed_at)
    }

    /// Whether `condition` holds.
    pub fn is_satisfied(&self, condition: &PathCondition) -> bool {
        match condition {
            PathCondition::SurveyResponse {
                survey_key,
                question_id,
                expected,
            } => {
                let Some(response) = self.latest_response(survey_key) else {
                    return false;
                };
                let Some(answer) = response
                    .responses
                    .iter()
                    .find(|q| &q.question_id == question_id)
                else {
                    return false;
                };
                match expected {
                    ExpectedAnswer::Choices(choices) => {
                        answer.selected.len() == choices.len()
                            && answer.selected.iter().all(|s| choices.contains(s))
                    }
                    ExpectedAnswer::Text(text) => answer
                        .text
                        .as_deref()
                        .is_some_and(|entered| entered.trim() == text.trim()),
                }
            }
            PathCondition::AssessmentLevel { node_name, level } => {
                self.score_records.iter().any(|record| {
                    record
                        .nodes
                        .iter()
                        .any(|node| &node.name == node_name && node.level == *level)
                })
            }
        }
    }

    /// Score of a path: the number of its conditions when all of them hold,
    /// otherwise zero.
    pub fn path_score(&self, conditions: &[PathCondition]) -> usize {
        if !conditions.is_empty() && conditions.iter().all(|c| self.is_satisfied(c)) {
            conditions.len()
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn response(key: &str, at: DateTime<Utc>, question: &str, selected: &[&str]) -> SurveyResponse {
        SurveyResponse {
            survey_key: key.to_string(),
            completed_at: at,
            responses: vec![QuestionResponse {
                question_id: question.to_string(),
                selected: selected.iter().map(|s| s.to_string()).collect(),
                text: None,
            }],
        }
    }

    #[test]
    fn test_latest_survey_response_wins() {
        let now = Utc::now();
        let history = LearnerHistory {
            survey_responses: vec![
                response("pre", now - Duration::minutes(5), "q1", &["b"]),
                response("pre", now, "q1", &["a"]),
            ],
            score_records: Vec::new(),
        };

        let wants_a = PathCondition::SurveyResponse {
            survey_key: "pre".to_string(),
            question_id: "q1".to_string(),
            expected: ExpectedAnswer::Choices(vec!["a".to_string()]),
        };
        let wants_b = PathCondition::SurveyResponse {
            survey_key: "pre".to_string(),
            question_id: "q1".to_string(),
            expected: ExpectedAnswer::Choices(vec!["b".to_string()]),
        };

        assert!(history.is_satisfied(&wants_a));
        assert!(!history.is_satisfied(&wants_b));
    }

    #[test]
    fn test_choice_sets_must_match_exactly() {
        let history = LearnerHistory {
            survey_responses: vec![response("s", Utc::now(), "q", &["a", "b"])],
            score_records: Vec::new(),
        };
        let subset = PathCondition::SurveyResponse {
            survey_key: "s".to_string(),
            question_id: "q".to_string(),
            expected: ExpectedAnswer::Choices(vec!["a".to_string()]),
        };
        let same = PathCondition::SurveyResponse {
            survey_key: "s".to_string(),
            question_id: "q".to_string(),
            expected: ExpectedAnswer::Choices(vec!["b".to_string(), "a".to_string()]),
        };
        assert!(!history.is_satisfied(&subset));
        assert!(history.is_satisfied(&same));
    }

    #[test]
    fn test_text_and_assessment_conditions() {
        let history = LearnerHistory {
            survey_responses: vec![SurveyResponse {
                survey_key: "s".to_string(),
                completed_at: Utc::now(),
                responses: vec![QuestionResponse {
                    question_id: "name".to_string(),
                    selected: Vec::new(),
                    text: Some(" alpha ".to_string()),
                }],
            }],
            score_records: vec![ScoreRecord {
                record_id: "r1".to_string(),
                nodes: vec![ScoreNode {
                    name: "Clear room".to_string(),
                    level: AssessmentLevel::AboveExpectation,
                }],
            }],
        };

        let text = PathCondition::SurveyResponse {
            survey_key: "s".to_string(),
            question_id: "name".to_string(),
            expected: ExpectedAnswer::Text("alpha".to_string()),
        };
        let above = PathCondition::AssessmentLevel {
            node_name: "Clear room".to_string(),
            level: AssessmentLevel::AboveExpectation,
        };
        let below = PathCondition::AssessmentLevel {
            node_name: "Clear room".to_string(),
            level: AssessmentLevel::BelowExpectation,
        };

        assert!(history.is_satisfied(&text));
        assert!(history.is_satisfied(&above));
        assert!(!history.is_satisfied(&below));
        assert!(above.needs_scores());
        assert!(!text.needs_scores());

        assert_eq!(history.path_score(&[text.clone(), above.clone()]), 2);
        assert_eq!(history.path_score(&[text, below]), 0);
        assert_eq!(history.path_score(&[]), 0);
    }
}
